use clap::{App, Arg, SubCommand};
use log::error;
use waystore::{RegionRegistry, SharedMonitor, Storage, StorageConfig, StoreError};

// Exit codes of the publish subcommand
const EXIT_INVALID_CONFIG: i32 = 1;
const EXIT_MISSING_FILE: i32 = 2;
const EXIT_SWAP_TIMEOUT: i32 = 3;
const EXIT_SHM_EXHAUSTED: i32 = 4;

fn main() {
    env_logger::init();

    let matches = App::new("waystore-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Shared-memory dataset publication for routing engines")
        .subcommand(
            SubCommand::with_name("publish")
                .about("Load a dataset and swap it into shared memory")
                .arg(
                    Arg::with_name("dataset")
                        .short("d")
                        .long("dataset")
                        .value_name("NAME")
                        .help("Logical dataset name prefixing region names")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("base")
                        .short("b")
                        .long("base")
                        .value_name("PATH")
                        .help("Path prefix of the dataset files (defaults to ./<dataset>)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("max-wait")
                        .short("w")
                        .long("max-wait")
                        .value_name("SECONDS")
                        .help("Seconds to wait for the region lock, -1 waits forever")
                        .default_value("-1")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("list").about("List published regions"))
        .get_matches();

    match matches.subcommand() {
        ("publish", Some(publish_matches)) => handle_publish(publish_matches),
        ("list", Some(_)) => handle_list(),
        _ => {
            println!("Use --help for usage information");
        }
    }
}

fn handle_publish(matches: &clap::ArgMatches) {
    let dataset = matches.value_of("dataset").unwrap();
    let base = matches
        .value_of("base")
        .map(String::from)
        .unwrap_or_else(|| format!("./{}", dataset));
    let max_wait: i64 = match matches.value_of("max-wait").unwrap().parse() {
        Ok(seconds) if seconds >= -1 => seconds,
        _ => {
            error!("--max-wait takes a non-negative integer or -1");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };

    let config = StorageConfig::new(base, dataset);
    if let Err(err) = Storage::new(config).run(max_wait) {
        error!("{}", err);
        std::process::exit(exit_code(&err));
    }
}

fn handle_list() {
    if !SharedMonitor::<RegionRegistry>::exists(waystore::CONTROL_REGION_NAME) {
        println!("no region registry on this host");
        return;
    }

    let monitor = match SharedMonitor::<RegionRegistry>::create_or_open(
        waystore::CONTROL_REGION_NAME,
    ) {
        Ok(monitor) => monitor,
        Err(err) => {
            error!("{}", err);
            std::process::exit(EXIT_SHM_EXHAUSTED);
        }
    };

    let registry = match monitor.lock() {
        Ok(guard) => guard,
        Err(err) => {
            error!("{}", err);
            std::process::exit(EXIT_SHM_EXHAUSTED);
        }
    };

    println!("{:<6} {:<48} {:>4} {:>10}", "slot", "region", "key", "timestamp");
    for (slot, entry) in registry.iter_in_use() {
        println!(
            "{:<6} {:<48} {:>4} {:>10}",
            slot,
            entry.name(),
            entry.shm_key,
            entry.timestamp
        );
    }
}

fn exit_code(err: &StoreError) -> i32 {
    match err {
        StoreError::MissingRequiredFile { .. } => EXIT_MISSING_FILE,
        StoreError::SwapTimedOut { .. } => EXIT_SWAP_TIMEOUT,
        StoreError::KeyExhausted | StoreError::RegistryFull | StoreError::Platform { .. } => {
            EXIT_SHM_EXHAUSTED
        }
        _ => EXIT_INVALID_CONFIG,
    }
}
