use std::env;
use std::process::exit;

use tracing::{error, info};

use todo_relay::config::PropertyStore;
use todo_relay::runner::Runner;

fn print_usage() {
    eprintln!(
        r#"Usage: todo-relay [command]

Commands:
  run                 Execute one poll/extract/notify run (default)
  set <key> <value>   Write a property into the state store
  get <key>           Read a property from the state store

Environment Variables:
  TODO_RELAY_STATE_PATH   Path to the sqlite property store
                          (default: todo_relay.db in the current directory)

Required properties (seed with `set` before the first run):
  lineAccessToken, lineGroupId, geminiApiKey, gmailAccessToken,
  senderWhitelist (comma-separated); optional: maxEmailsPerRun
"#
    );
}

fn state_path() -> String {
    env::var("TODO_RELAY_STATE_PATH").unwrap_or_else(|_| "todo_relay.db".to_string())
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let store = match PropertyStore::new(state_path()) {
        Ok(store) => store,
        Err(err) => {
            error!("cannot open state store: {}", err);
            exit(1);
        }
    };

    match args.first().map(String::as_str) {
        None | Some("run") => {
            let runner = Runner::new(store);
            match runner.run() {
                Ok(summary) => {
                    info!(
                        "fetched {} email(s), processed {}, extracted {} item(s), sent {} notification(s) in {:?}",
                        summary.emails_fetched,
                        summary.emails_processed,
                        summary.items_extracted,
                        summary.deliveries_sent,
                        summary.elapsed
                    );
                    if !summary.success {
                        info!("run completed with {} recorded error(s)", summary.errors.len());
                    }
                }
                Err(err) => {
                    error!("run aborted: {}", err);
                    exit(1);
                }
            }
        }
        Some("set") => match (args.get(1), args.get(2)) {
            (Some(key), Some(value)) => {
                if let Err(err) = store.set(key, value) {
                    error!("failed to set '{}': {}", key, err);
                    exit(1);
                }
                info!("property '{}' saved", key);
            }
            _ => {
                print_usage();
                exit(2);
            }
        },
        Some("get") => match args.get(1) {
            Some(key) => match store.get(key) {
                Ok(Some(value)) => println!("{}", value),
                Ok(None) => {
                    eprintln!("property '{}' is not set", key);
                    exit(1);
                }
                Err(err) => {
                    error!("failed to read '{}': {}", key, err);
                    exit(1);
                }
            },
            None => {
                print_usage();
                exit(2);
            }
        },
        Some(_) => {
            print_usage();
            exit(2);
        }
    }
}
