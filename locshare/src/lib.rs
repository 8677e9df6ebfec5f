use std::io::Write;

pub mod config;
pub mod gate;
pub mod geo;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod tasks;

pub use config::{load_env_vars, EnvVars};

fn get_file_name(path_str: Option<&str>) -> String {
    if let Some(path_str_val) = path_str {
        let path = std::path::Path::new(path_str_val);
        if let Some(file_name) = path.file_name() {
            if let Some(s) = file_name.to_str() {
                return s.to_string();
            }
        }
    }

    "unknown".to_string()
}

pub fn init_log() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            let level = record.level();
            let style = buf.default_level_style(level);
            let target_style = env_logger::fmt::style::Style::new().fg_color(Some(
                env_logger::fmt::style::RgbColor(140, 143, 145).into(),
            ));
            writeln!(
                buf,
                "{} [{style}{}{style:#}] {}{target_style}]{target_style:#} {}:{} - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                level,
                record.target(),
                get_file_name(record.file()),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}
