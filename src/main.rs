use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use remote_desktop_portal::env::{self, SessionType};
use remote_desktop_portal::{Config, PersistMode, RemoteDesktop};

static COMMANDS: &[&str] = &[
    "--probe : Report whether the portal and PipeWire are reachable, then exit.",
    "--screenshot <file> : Start a capture session and write one PNG screenshot.",
    "--type <text> : Start an input session and type the given text.",
];

fn main() -> Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .compact()
            .init();
    }

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--probe") => probe(),
        Some("--screenshot") => {
            let path = args
                .next()
                .map(PathBuf::from)
                .context("--screenshot needs an output file")?;
            screenshot(path)
        }
        Some("--type") => {
            let text = args.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                bail!("--type needs some text");
            }
            type_text(&text)
        }
        Some(other) => {
            tracing::error!("Unknown command: {}", other);
            bail!("unknown command {other}")
        }
        None => {
            #[allow(clippy::disallowed_macros)]
            {
                println!("USAGE: remote-desktop-portal <command>");
                println!();
                println!("Possible commands are:");
                for command in COMMANDS {
                    println!("\t{}", command);
                }
            }
            Ok(())
        }
    }
}

fn probe() -> Result<()> {
    let session_type = env::detect_session_type();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    let portal = runtime.block_on(env::is_portal_available());
    let pipewire = env::is_pipewire_available();

    tracing::info!(%session_type, portal, pipewire, "Environment probe");
    #[allow(clippy::disallowed_macros)]
    {
        println!("session type: {session_type}");
        println!("portal:       {}", if portal { "available" } else { "missing" });
        println!("pipewire:     {}", if pipewire { "available" } else { "missing" });
    }
    if session_type != SessionType::Wayland {
        tracing::warn!("Not a Wayland session, the portal may still work through its X11 backend");
    }
    Ok(())
}

fn screenshot(path: PathBuf) -> Result<()> {
    let desktop = RemoteDesktop::new().context("failed to connect to the portal")?;
    desktop
        .initialize(PersistMode::UntilRevoked, true)
        .context("portal handshake failed")?;

    let size = desktop.get_screen_size()?;
    let png = desktop.capture_screenshot()?;
    std::fs::write(&path, &png).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        width = size.width,
        height = size.height,
        bytes = png.len(),
        "Screenshot written"
    );

    desktop.close();
    Ok(())
}

fn type_text(text: &str) -> Result<()> {
    let interval = Config::with(|config| config.input.type_interval());
    let desktop = RemoteDesktop::new().context("failed to connect to the portal")?;
    desktop
        .initialize(PersistMode::UntilRevoked, false)
        .context("portal handshake failed")?;

    // give the focused window a moment after the consent dialog closes
    std::thread::sleep(Duration::from_millis(500));
    desktop.type_text(text, interval)?;
    tracing::info!(chars = text.chars().count(), "Text typed");

    desktop.close();
    Ok(())
}
