//! Interactive device linking from the terminal.

use crate::linker::{Artifact, Linker, Outcome};
use pairgate_channels::qr::generate_qr_terminal;
use pairgate_core::link::LinkRequest;
use pairgate_core::phone::normalize_phone;

/// Run one linking attempt and show its progress.
///
/// With a number the attempt uses a pairing code, otherwise a QR code.
pub async fn link_device(linker: &Linker, number: Option<String>) -> anyhow::Result<()> {
    cliclack::intro(console::style("pairgate link").bold().to_string())?;

    let request = match number {
        Some(raw) => LinkRequest::pair(normalize_phone(&raw)?),
        None => LinkRequest::qr(),
    };

    let spinner = cliclack::spinner();
    spinner.start(format!("Starting {} link...", request.mode));
    let pending = linker.begin(request).await?;

    let artifact = pending
        .artifact
        .await
        .map_err(|_| anyhow::anyhow!("attempt ended without a response"));
    let artifact = match artifact {
        Ok(Ok(artifact)) => {
            spinner.stop("Ready.");
            artifact
        }
        Ok(Err(e)) => {
            spinner.error(e.message());
            cliclack::outro("Nothing was linked.")?;
            return Ok(());
        }
        Err(e) => {
            spinner.error("Link attempt failed.");
            return Err(e);
        }
    };

    match artifact {
        Artifact::PairingCode(code) => {
            cliclack::note(
                "Pairing code",
                format!(
                    "{}\n\nWhatsApp → Linked Devices → Link a Device →\nLink with phone number instead",
                    console::style(code).bold()
                ),
            )?;
        }
        Artifact::Qr { payload, .. } => {
            let qr_text = generate_qr_terminal(&payload)?;
            cliclack::note("Scan this QR code with WhatsApp", &qr_text)?;
        }
    }

    let spinner = cliclack::spinner();
    spinner.start("Waiting for the device to link...");

    match pending.done.await {
        Ok(Outcome::Persisted { key, version }) => {
            spinner.stop(format!("Linked {key} (session version {version})."));
            cliclack::outro("Session stored. The session id was sent to the linked account.")?;
        }
        Ok(Outcome::Skipped(reason)) => {
            spinner.error(format!("Linked, but nothing was stored: {reason}"));
            cliclack::outro("Try again with: pairgate link")?;
        }
        Ok(Outcome::TimedOut) => {
            spinner.error("Linking timed out.");
            cliclack::outro("Try again with: pairgate link")?;
        }
        Ok(other) => {
            spinner.error(format!("Link did not complete: {other:?}"));
            cliclack::outro("Try again with: pairgate link")?;
        }
        Err(_) => {
            spinner.error("Link attempt ended unexpectedly.");
        }
    }

    Ok(())
}
