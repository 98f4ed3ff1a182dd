use clap::{App, Arg};

use loam::crypto;

fn main() {
    let matches = App::new("Key Generator")
        .version("0.1.0")
        .about("Generates base64 primary keys for server and client configs.")
        .arg(
            Arg::with_name("NKEYS")
                .help("Number of keys to generate")
                .required(false),
        )
        .get_matches();

    let count: usize = matches
        .value_of("NKEYS")
        .unwrap_or("1")
        .parse()
        .expect("key count must be a valid integer");

    for _ in 0..count {
        println!("{}", base64::encode(crypto::generate_key()));
    }
}
