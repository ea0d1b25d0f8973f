//! Config command implementation.

use anyhow::{Context, Result};

use peerlink_core::config::Config;

use super::{ConfigAction, ConfigArgs};
use crate::ui::parse_duration;

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    let mut config = Config::load()?;

    match args.action {
        ConfigAction::Get { key } => match get_config_value(&config, &key) {
            Some(v) => println!("{}: {}", key, v),
            None => println!("Unknown configuration key: {}", key),
        },

        ConfigAction::Set { key, value } => {
            if set_config_value(&mut config, &key, &value)? {
                config.validate()?;
                config.save()?;
                println!("Set {} = {}", key, value);
            } else {
                println!("Unknown configuration key: {}", key);
            }
        }

        ConfigAction::Show => {
            println!();
            println!("PeerLink Configuration");
            println!("{}", "─".repeat(50));
            println!();
            print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
            println!();
        }

        ConfigAction::Path => println!("{}", Config::config_path().display()),

        ConfigAction::Reset => {
            Config::default().save()?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

fn get_config_value(config: &Config, key: &str) -> Option<String> {
    match key {
        "device_name" => Some(config.general.device_name.clone()),
        "save_dir" => Some(config.general.resolved_save_dir().display().to_string()),
        "local_ip" => Some(
            config
                .network
                .local_ip
                .map_or_else(|| "auto".to_string(), |ip| ip.to_string()),
        ),
        "discovery_port" => Some(config.network.discovery_port.to_string()),
        "transfer_port" => Some(config.network.transfer_port.to_string()),
        "chat_port" => Some(config.network.chat_port.to_string()),
        "clipboard_port" => Some(config.network.clipboard_port.to_string()),
        "chunk_size" => Some(config.transfer.chunk_size.to_string()),
        "high_water_mark" => Some(config.transfer.high_water_mark.to_string()),
        "auto_accept" => Some(config.chat.auto_accept.to_string()),
        "poll_interval" => Some(format!("{}ms", config.clipboard.poll_interval.as_millis())),
        "sync_on_start" => Some(config.clipboard.sync_on_start.to_string()),
        _ => None,
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<bool> {
    match key {
        "device_name" => config.general.device_name = value.to_string(),
        "save_dir" => config.general.save_dir = Some(value.into()),
        "local_ip" => {
            config.network.local_ip = if value == "auto" {
                None
            } else {
                Some(value.parse()?)
            };
        }
        "discovery_port" => config.network.discovery_port = value.parse()?,
        "transfer_port" => config.network.transfer_port = value.parse()?,
        "chat_port" => config.network.chat_port = value.parse()?,
        "clipboard_port" => config.network.clipboard_port = value.parse()?,
        "chunk_size" => config.transfer.chunk_size = value.parse()?,
        "high_water_mark" => config.transfer.high_water_mark = value.parse()?,
        "auto_accept" => config.chat.auto_accept = value.parse()?,
        "poll_interval" => {
            config.clipboard.poll_interval = value
                .strip_suffix("ms")
                .and_then(|ms| ms.parse().ok())
                .map(std::time::Duration::from_millis)
                .or_else(|| parse_duration(value))
                .with_context(|| format!("Invalid duration '{}'", value))?;
        }
        "sync_on_start" => config.clipboard.sync_on_start = value.parse()?,
        _ => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_roundtrip() {
        let mut config = Config::default();
        assert!(set_config_value(&mut config, "chat_port", "17879").unwrap());
        assert_eq!(get_config_value(&config, "chat_port").as_deref(), Some("17879"));

        assert!(set_config_value(&mut config, "poll_interval", "250ms").unwrap());
        assert_eq!(
            get_config_value(&config, "poll_interval").as_deref(),
            Some("250ms")
        );

        assert!(set_config_value(&mut config, "local_ip", "10.0.0.8").unwrap());
        assert!(set_config_value(&mut config, "local_ip", "auto").unwrap());
        assert_eq!(config.network.local_ip, None);
    }

    #[test]
    fn test_unknown_and_invalid_values() {
        let mut config = Config::default();
        assert!(!set_config_value(&mut config, "no_such_key", "1").unwrap());
        assert!(set_config_value(&mut config, "chat_port", "not-a-port").is_err());
        assert!(get_config_value(&config, "no_such_key").is_none());
    }
}
