mod avatar;
mod db;
mod error;
mod ledger;
mod models;
mod password;
mod permissions;
mod relay;
mod routes;
mod state;
mod token;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use avatar::{AvatarCache, HttpAvatarSource};
use models::Permissions;
use relay::{RelayClient, RECONNECT_DELAY};
use state::AppState;

const SECRET_FILE: &str = "jwt_secret.key";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// Database path
    #[arg(short, long, env = "DATABASE_PATH", default_value = "solacecore.db")]
    db_path: String,

    /// Token signing secret; falls back to jwt_secret.key
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Game server relay host
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    relay_host: String,

    /// Game server relay port
    #[arg(long, env = "RELAY_PORT", default_value_t = 8082)]
    relay_port: u16,

    /// Days a cached bust render stays fresh
    #[arg(long, env = "AVATAR_TTL_DAYS", default_value_t = avatar::DEFAULT_TTL_DAYS)]
    avatar_ttl_days: u64,

    /// Directory for cached bust renders
    #[arg(long, env = "SKIN_CACHE_DIR", default_value = "./cache/skins")]
    skin_cache_dir: String,

    /// Upstream bust renderer, `{id}` is replaced by the player identifier
    #[arg(
        long,
        env = "SKIN_RENDER_URL",
        default_value = "https://mc-heads.net/head/{id}/128"
    )]
    skin_render_url: String,

    /// Allow cross-origin requests from any origin
    #[arg(long, env = "ENABLE_CORS")]
    enable_cors: bool,

    /// Operator to create on first run
    #[arg(long, env = "ADMIN_USERNAME")]
    admin_username: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let port = args.port;

    let jwt_secret = match args.jwt_secret.filter(|s| !s.trim().is_empty()) {
        Some(secret) => secret,
        None => load_or_generate_secret(Path::new(SECRET_FILE)),
    };

    tracing::info!("Initializing database at {}", args.db_path);
    let pool = db::init_pool(&args.db_path)
        .await
        .context("failed to open database")?;

    if let Some(username) = args.admin_username {
        provision_admin(&pool, username.trim()).await?;
    }

    let relay = RelayClient::new(
        format!("ws://{}:{}", args.relay_host, args.relay_port),
        RECONNECT_DELAY,
    );
    let relay_handle = relay.spawn();

    let mut notifications = relay.subscribe();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(message) => tracing::debug!("Game server: {message}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {skipped} game server notifications")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::fs::create_dir_all(&args.skin_cache_dir)
        .await
        .with_context(|| format!("failed to create {}", args.skin_cache_dir))?;
    let avatars = AvatarCache::new(
        &args.skin_cache_dir,
        avatar::ttl_days(args.avatar_ttl_days),
        Arc::new(HttpAvatarSource::new(args.skin_render_url)),
    );

    let state = AppState::new(pool, jwt_secret, relay, avatars);

    state.login_throttle.spawn_sweeper();

    let app = routes::router(state, args.enable_cors);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("SolaceCore listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay_handle.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Secret from the key file, or a new one persisted there.
fn load_or_generate_secret(path: &Path) -> String {
    if let Ok(saved) = std::fs::read_to_string(path) {
        let saved = saved.trim().to_string();
        if !saved.is_empty() {
            tracing::info!("Loaded JWT secret from {}", path.display());
            return saved;
        }
    }

    let secret = random_string(64);
    if let Err(e) = std::fs::write(path, &secret) {
        tracing::warn!("Could not save JWT secret to file: {e}");
    } else {
        tracing::info!("Generated and saved JWT secret to {}", path.display());
    }
    secret
}

/// Create the first operator with an all-capability role. No-op once any
/// operator exists.
async fn provision_admin(pool: &SqlitePool, username: &str) -> anyhow::Result<()> {
    if username.is_empty() {
        return Ok(());
    }
    let operators: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM moderators")
        .fetch_one(pool)
        .await?;
    if operators > 0 {
        return Ok(());
    }

    let temp_password = random_string(16);
    let password_hash = password::hash_password(&temp_password)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;

    let mut tx = pool.begin().await?;
    let operator_id = sqlx::query("INSERT INTO moderators (username, password_hash) VALUES (?, ?)")
        .bind(username)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

    sqlx::query("INSERT OR IGNORE INTO roles (name, permissions) VALUES ('Administrator', ?)")
        .bind(Permissions::all().to_stored())
        .execute(&mut *tx)
        .await?;
    let role_id: i64 = sqlx::query_scalar("SELECT id FROM roles WHERE name = 'Administrator'")
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query("INSERT INTO moderator_roles (moderator_id, role_id) VALUES (?, ?)")
        .bind(operator_id)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!("Created first-run operator {username}");
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        FIRST-RUN OPERATOR CREATED!           ║");
    println!("  ╠══════════════════════════════════════════════╣");
    println!("  ║  Username: {:<34}║", username);
    println!("  ║  Password: {:<34}║", temp_password);
    println!("  ╠══════════════════════════════════════════════╣");
    println!("  ║  PLEASE SAVE THESE CREDENTIALS NOW!          ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    Ok(())
}
