use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "youpin.toml";
const ENV_PREFIX: &str = "YOUPIN";

/// Process-wide settings. Built once at startup, then only borrowed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    // browser
    pub debug_port: u16,
    pub chrome_path: PathBuf,
    pub user_data_dir: PathBuf,
    pub auto_launch: bool,
    pub connect_attempts: u32,
    pub connect_retry_secs: f64,
    pub launch_wait_secs: f64,

    // marketplace
    pub base_url: String,
    pub game_id: u32,
    pub price_selector: String,
    pub fallback_selector: String,

    // pacing
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub content_wait_secs: f64,
    pub page_load_timeout_secs: f64,

    // io
    pub input_csv: PathBuf,
    pub output_dir: PathBuf,
    pub batch_size: usize,

    // logging
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            debug_port: 9222,
            chrome_path: PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            user_data_dir: PathBuf::from(r"C:\temp\chrome_debug"),
            auto_launch: true,
            connect_attempts: 3,
            connect_retry_secs: 2.0,
            launch_wait_secs: 3.0,
            base_url: "https://www.youpin898.com/market/goods-list".to_string(),
            game_id: 730,
            price_selector: r#"[class^="btn-box___"]"#.to_string(),
            fallback_selector: r#"[class*="btn-box"]"#.to_string(),
            min_delay_secs: 1.0,
            max_delay_secs: 3.0,
            content_wait_secs: 5.0,
            page_load_timeout_secs: 10.0,
            input_csv: PathBuf::from("items.csv"),
            output_dir: PathBuf::from("output"),
            batch_size: 10,
            log_level: "info".to_string(),
            log_file: Some(PathBuf::from("scraper.log")),
        }
    }
}

/// Command-line values that take precedence over file and environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub input_csv: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub auto_launch: Option<bool>,
    pub log_level: Option<String>,
}

impl Settings {
    /// Defaults, then the TOML file (optional unless given explicitly), then
    /// `YOUPIN_*` environment variables, then CLI overrides.
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        builder = match file {
            Some(path) => builder.add_source(::config::File::from(path).required(true)),
            None => builder.add_source(::config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };
        let mut settings: Settings = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.apply(overrides);
        settings.validate()?;
        Ok(settings)
    }

    fn apply(&mut self, o: &Overrides) {
        if let Some(p) = &o.input_csv {
            self.input_csv = p.clone();
        }
        if let Some(p) = &o.output_dir {
            self.output_dir = p.clone();
        }
        if let Some(n) = o.batch_size {
            self.batch_size = n;
        }
        if let Some(b) = o.auto_launch {
            self.auto_launch = b;
        }
        if let Some(l) = &o.log_level {
            self.log_level = l.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("min_delay_secs", self.min_delay_secs),
            ("max_delay_secs", self.max_delay_secs),
            ("content_wait_secs", self.content_wait_secs),
            ("page_load_timeout_secs", self.page_load_timeout_secs),
            ("connect_retry_secs", self.connect_retry_secs),
            ("launch_wait_secs", self.launch_wait_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                bail!("{} must be a non-negative number of seconds, got {}", name, value);
            }
        }
        if self.min_delay_secs > self.max_delay_secs {
            bail!(
                "min_delay_secs ({}) is larger than max_delay_secs ({})",
                self.min_delay_secs,
                self.max_delay_secs
            );
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.connect_attempts == 0 {
            bail!("connect_attempts must be at least 1");
        }
        Url::parse(&self.base_url).with_context(|| format!("base_url {:?} is not a URL", self.base_url))?;
        Ok(())
    }

    pub fn content_wait(&self) -> Duration {
        Duration::from_secs_f64(self.content_wait_secs)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.page_load_timeout_secs)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs_f64(self.connect_retry_secs)
    }

    pub fn launch_wait(&self) -> Duration {
        Duration::from_secs_f64(self.launch_wait_secs)
    }

    /// Shell line an operator can paste to bring Chrome up for attach mode.
    pub fn chrome_command_line(&self) -> String {
        format!(
            "\"{}\" --remote-debugging-port={} --user-data-dir=\"{}\"",
            self.chrome_path.display(),
            self.debug_port,
            self.user_data_dir.display()
        )
    }
}
