use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::info;

use coderun::config::EngineConfig;
use coderun::core::{LimitOverride, Registry, Submission};
use coderun::engine::Engine;

/// One source file of a request
#[derive(Debug, Deserialize)]
struct RequestFile {
    path: String,
    content: String,
    /// `content` is base64 rather than plain text
    #[serde(default)]
    base64: bool,
}

/// Submission read from stdin
#[derive(Debug, Deserialize)]
struct Request {
    language: String,
    /// Single source file written under the language's default name
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    files: Vec<RequestFile>,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    stdin_base64: Option<String>,
    #[serde(default)]
    limits: LimitOverride,
    #[serde(default)]
    tenant: Option<String>,
}

impl Request {
    fn into_submission(self) -> Result<Submission> {
        let mut submission = match self.code {
            Some(code) => Submission::new(self.language, code),
            None => Submission::empty(self.language),
        };

        for file in self.files {
            let content = if file.base64 {
                BASE64
                    .decode(file.content.as_bytes())
                    .with_context(|| format!("Invalid base64 content for {}", file.path))?
            } else {
                file.content.into_bytes()
            };
            submission = submission.with_file(file.path, content);
        }

        let stdin = match (self.stdin, self.stdin_base64) {
            (_, Some(encoded)) => BASE64
                .decode(encoded.as_bytes())
                .context("Invalid base64 stdin")?,
            (Some(text), None) => text.into_bytes(),
            (None, None) => Vec::new(),
        };
        submission = submission.with_stdin(stdin).with_limits(self.limits);

        if let Some(tenant) = self.tenant {
            submission = submission.with_tenant(tenant);
        }
        Ok(submission)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coderun=info".parse()?),
        )
        .init();

    let config = EngineConfig::from_env()?;

    if std::env::args().any(|arg| arg == "--languages") {
        let registry = Registry::load(config.languages_path.as_deref())?;
        println!("{}", serde_json::to_string_pretty(&registry.languages())?);
        return Ok(());
    }

    let engine = Engine::from_config(&config).await?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read request from stdin")?;
    let request: Request = serde_json::from_str(&input).context("Invalid request JSON")?;
    info!("Received submission: language={}", request.language);

    let result = engine.run(request.into_submission()?).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
