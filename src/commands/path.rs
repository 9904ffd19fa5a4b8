//! `gnmic path`

use argh::FromArgs;
use serde_json::json;

use super::{CONFIG_ERROR, SUCCESS};
use gnmic::xpath;

/// parse and normalize gNMI paths
#[derive(FromArgs)]
#[argh(subcommand, name = "path")]
pub struct PathCommand {
    /// paths to parse
    #[argh(positional)]
    pub paths: Vec<String>,

    /// print the structured form as JSON
    #[argh(switch)]
    pub json: bool,
}

impl PathCommand {
    pub fn run(&self) -> i32 {
        if self.paths.is_empty() {
            eprintln!("no paths provided");
            return CONFIG_ERROR;
        }

        let mut code = SUCCESS;
        for input in &self.paths {
            match xpath::parse(input) {
                Ok(path) => {
                    if self.json {
                        let elements: Vec<_> = path
                            .elem
                            .iter()
                            .map(|elem| {
                                json!({
                                    "name": elem.name,
                                    "key": elem.key,
                                })
                            })
                            .collect();
                        let structured = json!({
                            "origin": path.origin,
                            "elem": elements,
                        });
                        println!("{structured}");
                    } else {
                        println!("{}", xpath::to_string(&path));
                    }
                }
                Err(err) => {
                    eprintln!("{input}: {err}");
                    code = CONFIG_ERROR;
                }
            }
        }

        code
    }
}
