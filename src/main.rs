use spikesort::local::process_file;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 3 {
        match args[1].as_str() {
            "sort" => process_file::run(&args[2], &args[3..]).unwrap(),
            _ => println!("Invalid argument, please use 'sort <config.yaml> <trial.csv>...'"),
        }
    } else {
        println!("Usage: sort <config.yaml> <trial.csv> [trial.csv ...]");
    }
}
