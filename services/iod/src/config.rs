use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
}

#[derive(Serialize, Deserialize)]
pub struct Name {
    pub node: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Rmem {
    pub servers: usize,
    pub first_node: usize,
}

#[derive(Serialize, Deserialize)]
pub struct IodConfig {
    pub logging: Logging,
    pub name: Name,
    pub rmem: Rmem,
}

impl Default for IodConfig {
    fn default() -> IodConfig {
        IodConfig {
            logging: Logging {
                level: "info".to_string(),
            },
            name: Name { node: 0 },
            rmem: Rmem {
                servers: 1,
                first_node: 1,
            },
        }
    }
}

impl IodConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> IodConfig {
        serdeconv::from_toml_file(path).expect("Error loading I/O cluster configuration file")
    }
}
