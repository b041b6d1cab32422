use std::fmt::Write;
use std::path::PathBuf;
use std::{env, fs};

/// Compile-time settings, overridable through `TROUBLE_CS_<NAME>` environment variables.
static CONFIGS: &[(&str, usize)] = &[
    // name, default
    ("CONFIG_SLOTS", 4),
    ("EVENT_QUEUE_SIZE", 8),
    ("CONTROL_TX_QUEUE_SIZE", 4),
    ("SUBEVENT_DATA_MAX", 251),
];

fn main() {
    let mut data = String::new();

    for (name, default) in CONFIGS {
        let key = format!("TROUBLE_CS_{}", name);
        println!("cargo:rerun-if-env-changed={}", key);

        let value = match env::var(&key) {
            Ok(value) => match value.parse::<usize>() {
                Ok(value) => value,
                Err(_) => panic!("{} must be an unsigned integer, got `{}`", key, value),
            },
            Err(_) => *default,
        };
        writeln!(&mut data, "pub const {}: usize = {};", name, value).unwrap();
    }

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap());
    fs::write(out_dir.join("config.rs"), data).unwrap();
    println!("cargo:rerun-if-changed=build.rs");
}
