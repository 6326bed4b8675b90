//! `qvmd openapi`: write out the HTTP API description.

use clap::Args;
use std::path::PathBuf;

use qvmd::api::{render_openapi, DocFormat};

/// Write the OpenAPI document of the qvmd HTTP API.
#[derive(Args, Debug)]
pub struct OpenapiCmd {
    /// Write to this file instead of stdout
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Document encoding
    #[arg(short, long, value_enum, default_value_t = DocFormat::Json)]
    format: DocFormat,
}

impl OpenapiCmd {
    /// Run the openapi command.
    pub fn run(&self) -> qvmd::Result<()> {
        let document = render_openapi(self.format)?;

        let Some(path) = &self.output else {
            println!("{}", document);
            return Ok(());
        };

        std::fs::write(path, document)?;
        tracing::info!(path = %path.display(), format = ?self.format, "openapi document written");
        Ok(())
    }
}
