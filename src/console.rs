use std::{
    io::{self, BufRead, Write},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use transmission_session::{
    config::{AppConfig, Command},
    diff::EmptyNotice,
    dispatch::{BulkAction, DispatchPlan},
    permissions::{AuthorizationOutcome, BeginOutcome},
    rpc::TransmissionClient,
    session::{Session, SessionEvent},
    tags::DisplayEntry,
    TorrentRecord,
};

pub fn run(config: AppConfig, command: Command) -> Result<()> {
    let client = TransmissionClient::new(config.rpc.clone())
        .context("failed to construct Transmission RPC client")?;
    let endpoint = client.endpoint().to_string();
    let session = Session::spawn(client, config.session.clone());
    // Room for one torrent-get plus one tags-get-list round trip.
    let wait = config.rpc.timeout * 2 + Duration::from_secs(1);

    session.refresh();
    match wait_for(&session, wait, |event| {
        matches!(
            event,
            SessionEvent::ListChanged { .. } | SessionEvent::RefreshFailed(_)
        )
    }) {
        Some(SessionEvent::RefreshFailed(reason)) => {
            bail!("could not load torrents from {endpoint}: {reason}")
        }
        Some(_) => {}
        None => bail!("timed out waiting for {endpoint}"),
    }

    match command {
        Command::List => print_torrents(&session.snapshot()),
        Command::Tags => {
            let entries = match wait_for(&session, wait, |event| {
                matches!(event, SessionEvent::TagsChanged(_))
            }) {
                Some(SessionEvent::TagsChanged(entries)) => entries,
                _ => session.tag_entries(),
            };
            print_tags(&entries);
        }
        Command::Watch => watch(&session),
        Command::Authorize { id } => authorize(&session, id, wait)?,
        Command::Remove {
            ids,
            yes,
            delete_data,
        } => {
            let plan = session.dispatch(BulkAction::Remove, &ids)?;
            let mut expected = plan.calls.len();
            if !plan.needs_confirmation.is_empty() {
                if yes {
                    session.confirm_remove(&plan.needs_confirmation, delete_data)?;
                    expected += 1;
                } else {
                    println!(
                        "{} torrent(s) need confirmation; rerun with --yes: {:?}",
                        plan.needs_confirmation.len(),
                        plan.needs_confirmation
                    );
                }
            }
            await_calls(&session, expected, wait);
        }
        Command::Relocate { id, to, no_move } => {
            let plan = session.dispatch(BulkAction::Relocate, &[id])?;
            let Some(target) = plan.needs_destination else {
                return Ok(());
            };
            let Some(location) = to else {
                bail!("relocating torrent {target} needs --to <path>");
            };
            session.relocate(target, &location, !no_move)?;
            await_calls(&session, 1, wait);
        }
        Command::Start { ids } => run_action(&session, BulkAction::Start, &ids, wait)?,
        Command::ForceStart { ids } => run_action(&session, BulkAction::ForceStart, &ids, wait)?,
        Command::Stop { ids } => run_action(&session, BulkAction::Stop, &ids, wait)?,
        Command::StartStop { ids } => run_action(&session, BulkAction::StartStop, &ids, wait)?,
        Command::Sequential { ids } => run_action(&session, BulkAction::Sequential, &ids, wait)?,
        Command::Verify { ids } => run_action(&session, BulkAction::Verify, &ids, wait)?,
        Command::MoveTop { ids } => run_action(&session, BulkAction::MoveTop, &ids, wait)?,
        Command::MoveUp { ids } => run_action(&session, BulkAction::MoveUp, &ids, wait)?,
        Command::MoveDown { ids } => run_action(&session, BulkAction::MoveDown, &ids, wait)?,
        Command::MoveBottom { ids } => run_action(&session, BulkAction::MoveBottom, &ids, wait)?,
    }
    Ok(())
}

fn run_action(session: &Session, action: BulkAction, ids: &[i64], wait: Duration) -> Result<()> {
    let plan: DispatchPlan = session.dispatch(action, ids)?;
    if let Some(value) = plan.toggle {
        println!("{} -> {}", action.label(), if value { "on" } else { "off" });
    }
    await_calls(session, plan.calls.len(), wait);
    Ok(())
}

fn authorize(session: &Session, id: i64, wait: Duration) -> Result<()> {
    let spec = match session.begin_authorization(id) {
        BeginOutcome::Prompt(spec) => spec,
        BeginOutcome::AlreadyPending(fingerprint) => {
            println!("Authorization for {} is already pending", fingerprint.root);
            return Ok(());
        }
        BeginOutcome::NoActionNeeded => {
            println!("Torrent {id} needs no authorization");
            return Ok(());
        }
    };

    println!("Grant access to {} for:", spec.root());
    println!("{}", spec.summary());
    print!("Granted URI (empty to deny): ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let granted = line.trim();
    let outcome = if granted.is_empty() {
        AuthorizationOutcome::Denied
    } else {
        AuthorizationOutcome::Granted(granted.to_string())
    };
    let denied = outcome == AuthorizationOutcome::Denied;
    session.authorization_result(spec.fingerprint, outcome);
    if denied {
        println!("Authorization denied; torrents stay blocked");
        return Ok(());
    }

    let deadline = Instant::now() + wait;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match session.events().recv_timeout(remaining) {
            Ok(SessionEvent::Warning(message)) => println!("warning: {message}"),
            Ok(SessionEvent::Reconciled(result)) => {
                println!(
                    "Reconciled: {} to start, {} to relocate, {} to recheck",
                    result.to_start.len(),
                    result.to_relocate.len(),
                    result.to_recheck.len()
                );
                await_calls(session, result.calls().len(), wait);
                return Ok(());
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn watch(session: &Session) {
    while let Ok(event) = session.events().recv() {
        match event {
            SessionEvent::ListChanged { effects, outcome } => {
                if effects.count_changed {
                    println!(
                        "{} torrent(s) (+{} -{})",
                        outcome.count, outcome.added, outcome.removed
                    );
                }
                if let Some(notice) = effects.empty_notice {
                    println!("{}", notice.message());
                }
            }
            SessionEvent::RefreshFailed(reason) => eprintln!("refresh failed: {reason}"),
            SessionEvent::Warning(message) => eprintln!("warning: {message}"),
            SessionEvent::CallFailed { method, reason } => eprintln!("{method} failed: {reason}"),
            _ => {}
        }
    }
}

fn await_calls(session: &Session, expected: usize, wait: Duration) {
    let mut settled = 0;
    let deadline = Instant::now() + wait;
    while settled < expected {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            eprintln!("timed out waiting for {} call(s)", expected - settled);
            return;
        };
        match session.events().recv_timeout(remaining) {
            Ok(SessionEvent::CallCompleted { method }) => {
                settled += 1;
                println!("{method}: ok");
            }
            Ok(SessionEvent::CallFailed { method, reason }) => {
                settled += 1;
                eprintln!("{method}: {reason}");
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

fn wait_for<F>(session: &Session, wait: Duration, matches: F) -> Option<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match session.events().recv_timeout(remaining) {
            Ok(event) if matches(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn print_torrents(torrents: &[TorrentRecord]) {
    if torrents.is_empty() {
        if let Some(notice) = EmptyNotice::for_counts(0, 0) {
            println!("{}", notice.message());
        }
        return;
    }
    for torrent in torrents {
        let flags: String = [
            (torrent.is_magnet, 'M'),
            (torrent.is_forced, 'F'),
            (torrent.is_sequential, 'S'),
            (torrent.needs_auth, 'A'),
        ]
        .iter()
        .map(|&(set, flag)| if set { flag } else { '-' })
        .collect();
        println!(
            "{:>5}  {:<13}  {}  {}",
            torrent.id,
            torrent.status.label(),
            flags,
            torrent.name
        );
    }
}

fn print_tags(entries: &[DisplayEntry]) {
    for entry in entries {
        match entry {
            DisplayEntry::Header(group) => println!("[{group}]"),
            DisplayEntry::Item(tag) => println!("  {} ({})", tag.name, tag.count),
        }
    }
}
