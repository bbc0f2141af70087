//! Slash commands dispatched from chat: `/register`, `/login`, `/kick`.

use tracing::{info, warn};

use crate::connect::Session;

pub(crate) async fn dispatch(session: &mut Session, line: &str) -> anyhow::Result<()> {
    let mut args = line.split_whitespace();
    let Some(command) = args.next() else {
        return Ok(());
    };

    match command.to_lowercase().as_str() {
        "/register" => register(session, args.next()).await,
        "/login" => login(session, args.next()).await,
        "/kick" => {
            let target = args.next().map(str::to_owned);
            let reason = args.collect::<Vec<_>>().join(" ");
            kick(session, target.as_deref(), &reason).await
        }
        _ => session.system_message("&cCommand not found!").await,
    }
}

async fn register(session: &mut Session, password: Option<&str>) -> anyhow::Result<()> {
    let Some(password) = password else {
        return session.system_message("&cUsage: /register <password>").await;
    };

    match session.shared().identities().register(session.name(), password) {
        Ok(true) => {
            session.shared().registry().set_authenticated(session.key());
            session
                .system_message("&aRegistered and logged in successfully!")
                .await
        }
        Ok(false) => {
            session
                .system_message("&cYou are already registered! Use /login.")
                .await
        }
        Err(e) => {
            warn!(name = session.name(), "identity store failure: {e}");
            session
                .system_message("&cRegistration is unavailable right now; try again later.")
                .await
        }
    }
}

async fn login(session: &mut Session, password: Option<&str>) -> anyhow::Result<()> {
    let Some(password) = password else {
        return session.system_message("&cUsage: /login <password>").await;
    };

    if session.shared().identities().verify(session.name(), password) {
        session.shared().registry().set_authenticated(session.key());
        session
            .system_message("&aLogged in! You can now move and speak.")
            .await
    } else {
        session.system_message("&cInvalid password!").await
    }
}

async fn kick(session: &mut Session, target: Option<&str>, reason: &str) -> anyhow::Result<()> {
    let is_admin = session
        .shared()
        .config()
        .admins
        .iter()
        .any(|admin| admin == session.name());
    if !is_admin {
        return session
            .system_message("&cYou do not have permission to use this command!")
            .await;
    }

    let Some(target) = target else {
        return session.system_message("&cUsage: /kick <player> [reason]").await;
    };
    let reason = if reason.is_empty() {
        "Kicked by operator"
    } else {
        reason
    };

    match session.shared().registry().find_by_name(target) {
        Some(victim) => {
            info!(by = session.name(), target, reason, "kick");
            session.broadcast_system_message(&format!("&e{target} was kicked: {reason}"));
            session.shared().registry().kick(victim, reason);
            Ok(())
        }
        None => {
            session
                .system_message(&format!("&cPlayer '{target}' not found"))
                .await
        }
    }
}
