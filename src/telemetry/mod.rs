use anyhow::{Result, anyhow};
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Default, Debug)]
pub struct Builder {
	log_level: Option<String>,
}

pub fn builder() -> Builder {
	Builder::default()
}

/// Turns a log level, or a full filter directive, into a filter for our crates
pub fn filter_from_value(value: &str) -> Result<EnvFilter> {
	let directive = match value {
		// Only show the scan layer's own logs at the chosen level
		"error" | "warn" | "info" | "debug" | "trace" => {
			format!("error,tabletscan={value},tabletscan_core={value}")
		}
		// Otherwise treat the value as a filter directive
		_ => value.to_string(),
	};
	EnvFilter::builder().parse(&directive).map_err(|e| anyhow!("Invalid log filter '{value}': {e}"))
}

impl Builder {
	/// Set the log level on the builder
	pub fn with_log_level(mut self, log_level: &str) -> Self {
		self.log_level = Some(log_level.to_string());
		self
	}

	/// Build a tracing dispatcher which writes compact logs to stderr
	pub fn build(self) -> Result<Box<dyn Subscriber + Send + Sync + 'static>> {
		let filter = filter_from_value(self.log_level.as_deref().unwrap_or("info"))?;
		let layer = tracing_subscriber::fmt::layer()
			.compact()
			.with_ansi(true)
			.with_target(true)
			.with_span_events(FmtSpan::NONE)
			.with_writer(std::io::stderr)
			.with_filter(filter);
		Ok(Box::new(tracing_subscriber::registry().with(layer)))
	}

	/// Install the subscriber as the global default
	pub fn init(self) -> Result<()> {
		self.build()?.try_init()?;
		Ok(())
	}
}
