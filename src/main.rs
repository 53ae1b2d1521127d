//! Microsoft Teams tab SSO relay
//!
//! Validates Entra ID tokens from the Teams tab and mints local web sessions.

use std::process::ExitCode;

use clap::Parser;
use jsonwebtoken::jwk::AlgorithmParameters;
use tracing::{error, info};

use msteams_tab_auth::{
    cli::{Cli, Command},
    config::Config,
    server::TabAuthServer,
    setup_tracing,
    sso::{
        KeyResolver, ResolveKey, ValidateTokenParams,
        jwks::{HttpJwksSource, JwksSource},
        validate_token,
    },
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    match cli.command {
        Some(Command::CheckToken { ref token }) => run_check_token(&config, token).await,
        Some(Command::Jwks) => run_jwks(&config).await,
        Some(Command::Serve) | None => run_server(cli, config).await,
    }
}

/// Load and validate configuration, applying CLI overrides
fn load_config(cli: &Cli) -> msteams_tab_auth::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Validate one token with the configured settings and print the outcome
async fn run_check_token(config: &Config, token: &str) -> ExitCode {
    let resolver = KeyResolver::from_config(&config.sso).await;
    let expected_tenant_ids = config.expected_tenant_ids();

    let params = ValidateTokenParams {
        token,
        key_resolver: Some(&resolver as &dyn ResolveKey),
        expected_tenant_ids: &expected_tenant_ids,
        skip_validation: config.sso.skip_token_validation,
        site_url: &config.site.site_url,
        client_id: &config.tab_app.app_client_id,
        clock_skew: config.sso.clock_skew,
    };

    let result = validate_token(&params).await;
    resolver.shutdown().await;

    match result {
        Ok(Some(claims)) => match serde_json::to_string_pretty(&claims) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize claims: {e}");
                ExitCode::FAILURE
            }
        },
        Ok(None) => {
            println!("Empty token accepted (skip mode); no claims");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Rejected ({}): {}", e.status_code(), e.public_message());
            eprintln!("  reason: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Fetch the JWKS once and list the keys
async fn run_jwks(config: &Config) -> ExitCode {
    let source = HttpJwksSource::new(config.sso.jwks_url.clone(), config.sso.jwks_fetch_timeout);
    match source.fetch().await {
        Ok(set) => {
            println!("{} key(s) at {}:\n", set.keys.len(), config.sso.jwks_url);
            for jwk in &set.keys {
                let kty = match jwk.algorithm {
                    AlgorithmParameters::RSA(_) => "RSA",
                    AlgorithmParameters::EllipticCurve(_) => "EC",
                    AlgorithmParameters::OctetKeyPair(_) => "OKP",
                    AlgorithmParameters::OctetKey(_) => "oct (ignored)",
                };
                println!(
                    "  {:<40} {}",
                    jwk.common.key_id.as_deref().unwrap_or("<no kid>"),
                    kty
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to fetch JWKS: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the SSO server
async fn run_server(cli: Cli, config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        skip_token_validation = config.sso.skip_token_validation,
        "Starting Teams tab SSO relay"
    );

    let server = match TabAuthServer::new(config, cli.config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    // Run with graceful shutdown
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::from(e.exit_code());
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
