//! Line-oriented front end for the session manager
//!
//! Reads commands from stdin and prints every state change and every received
//! message as it is observed. It only ever calls the manager's command interface
//! and reads its watch channels.

use std::fmt;
use std::time::Duration;

use color_eyre::Result;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::mqtt::config::SessionConfig;
use crate::mqtt::message_manager::MessageLog;
use crate::mqtt::mqtt_handler::{ConnectionState, SessionManager};

/// How long `quit` waits for the broker connection to close cleanly
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const HELP: &str = "\
Commands:
  connect                  connect to the configured broker
  disconnect               close the session
  publish <text>           send <text> to the topic (alias: send)
  config                   show the stored configuration
  config <field> <value>   change host|port|topic|user|pass, applied on next connect
  status                   show the connection state
  messages                 list received messages, newest first
  help                     show this text
  quit                     leave";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigField {
    Host,
    Port,
    Topic,
    User,
    Pass,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Publish(String),
    ShowConfig,
    SetConfig(ConfigField, String),
    Status,
    Messages,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word.to_lowercase().as_str() {
        "connect" => Ok(Command::Connect),
        "disconnect" => Ok(Command::Disconnect),
        "publish" | "send" => Ok(Command::Publish(rest.to_string())),
        "status" => Ok(Command::Status),
        "messages" => Ok(Command::Messages),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "config" if rest.is_empty() => Ok(Command::ShowConfig),
        "config" => {
            let (field, value) = rest
                .split_once(char::is_whitespace)
                .map(|(f, v)| (f, v.trim()))
                .unwrap_or((rest, ""));
            let field = match field.to_lowercase().as_str() {
                "host" => ConfigField::Host,
                "port" => ConfigField::Port,
                "topic" => ConfigField::Topic,
                "user" | "username" => ConfigField::User,
                "pass" | "password" => ConfigField::Pass,
                other => return Err(ParseError(format!("unknown config field '{other}'"))),
            };
            Ok(Command::SetConfig(field, value.to_string()))
        }
        "" => Err(ParseError("empty command, try 'help'".into())),
        other => Err(ParseError(format!("unknown command '{other}', try 'help'"))),
    }
}

/// Returns a copy of `config` with one field replaced
pub fn edit_config(
    config: &SessionConfig,
    field: ConfigField,
    value: &str,
) -> Result<SessionConfig, ParseError> {
    let mut updated = config.clone();
    match field {
        ConfigField::Host if value.is_empty() => {
            return Err(ParseError("host must not be empty".into()))
        }
        ConfigField::Host => updated.host = value.to_string(),
        ConfigField::Port => {
            updated.port = value
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ParseError(format!("'{value}' is not a port between 1 and 65535")))?;
        }
        ConfigField::Topic if value.is_empty() => {
            return Err(ParseError("topic must not be empty".into()))
        }
        ConfigField::Topic => updated.topic = value.to_string(),
        ConfigField::User => updated.username = value.to_string(),
        ConfigField::Pass => updated.password = SecretString::from(value.to_string()),
    }
    Ok(updated)
}

pub struct Console {
    manager: SessionManager,
}

impl Console {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    pub async fn run(self) -> Result<()> {
        let observers = [
            tokio::spawn(watch_state(self.manager.subscribe_state())),
            tokio::spawn(watch_messages(self.manager.subscribe_messages())),
        ];

        println!("MQTT Demo");
        println!("{HELP}");
        self.print_status();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => self.execute(command),
                Err(e) => println!("{e}"),
            }
        }

        debug!("Console input closed");
        stop(observers);
        if !self.manager.shutdown(SHUTDOWN_GRACE).await {
            warn!("Leaving before the session finished closing");
        }
        Ok(())
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Connect => {
                let state = self.manager.state();
                if !state.can_connect() {
                    println!("Already {}", state.label());
                }
                self.manager.connect();
            }
            Command::Disconnect => {
                if !self.manager.state().can_disconnect() {
                    println!("Nothing to disconnect");
                }
                self.manager.disconnect();
            }
            Command::Publish(text) => {
                if !self.manager.state().can_publish() {
                    println!("Not connected, message not sent");
                }
                self.manager.publish(&text);
            }
            Command::ShowConfig => println!("{:#?}", self.manager.config()),
            Command::SetConfig(field, value) => {
                match edit_config(&self.manager.config(), field, &value) {
                    Ok(updated) => {
                        self.manager.configure(updated);
                        println!("Configuration updated, used on next connect");
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Command::Status => self.print_status(),
            Command::Messages => print_log(&self.manager.messages()),
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }
    }

    fn print_status(&self) {
        let state = self.manager.state();
        println!("状态: {} ({})  broker: {}", state.label(), state, self.manager.config());
    }
}

fn stop(observers: [JoinHandle<()>; 2]) {
    for observer in observers {
        observer.abort();
    }
}

async fn watch_state(mut rx: watch::Receiver<ConnectionState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        println!("状态: {}", state.label());
    }
    warn!("State channel closed");
}

async fn watch_messages(mut rx: watch::Receiver<MessageLog>) {
    let mut last_seen: Option<u64> = None;
    while rx.changed().await.is_ok() {
        let fresh: Vec<String> = {
            let log = rx.borrow_and_update();
            let fresh = log
                .iter()
                .take_while(|e| last_seen.map_or(true, |seen| e.received_order > seen))
                .map(|e| e.to_string())
                .collect();
            if let Some(newest) = log.newest() {
                last_seen = Some(newest.received_order);
            }
            fresh
        };
        for line in fresh.iter().rev() {
            println!("{line}");
        }
    }
}

fn print_log(log: &MessageLog) {
    if log.is_empty() {
        println!("暂无消息");
        return;
    }
    println!("接收到的消息:");
    for entry in log.iter() {
        println!("  {entry}");
    }
}
