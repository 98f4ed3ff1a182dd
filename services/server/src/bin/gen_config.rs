use clap::{App, Arg};

use burrow::config::{ServerConfig, User};
use loam::crypto;

fn main() {
    let matches = App::new("Burrow Config Generator")
        .version("0.1.0")
        .about("Writes a server config with a fresh primary key.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path the config will be written to")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();

    let mut cfg = ServerConfig::default();
    cfg.authentication.key = base64::encode(crypto::generate_key());
    cfg.users.push(User {
        name: "user".to_string(),
        password: base64::encode(crypto::generate_key()),
    });

    let rendered = serdeconv::to_toml_string(&cfg).expect("failed to render config");
    std::fs::write(config_path, rendered).expect("failed to write config file");

    println!("wrote {}", config_path);
}
