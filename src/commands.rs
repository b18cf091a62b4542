//! Line-oriented control surface read from stdin by the binary.
//!
//! Each line maps to one [`AgentCommand`] sent through the [`AgentHandle`], or
//! to a read-only query. Nothing here touches the orchestrator directly.

use std::io::{BufRead, Write};

use crate::agent_engine::control::{AgentCommand, AgentHandle};
use crate::agent_engine::history::ActionLog;
use crate::agent_engine::state::{ActiveHours, AgentMode};
use crate::errors::DeskResult;
use crate::storage::StateStore;

pub const HELP: &str = "\
commands:
  start goal <text>       start a goal-directed run
  start roam              start free roam
  stop | pause | resume | restart
  window <hint>           set the active-window hint (`window -` clears it)
  hours <HH:MM> <HH:MM>   set active hours (`hours -` clears them)
  state                   print the current state
  snapshots               list snapshot files
  log [n]                 show the last n logged actions (default 10)
  prune <n>               keep only the newest n snapshots
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Agent(AgentCommand),
    ShowState,
    ListSnapshots,
    ShowLog(usize),
    Prune(usize),
    Help,
    Quit,
}

pub fn parse_line(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };

    let command = match head.to_ascii_lowercase().as_str() {
        "start" => {
            let (mode, goal) = match rest.split_once(char::is_whitespace) {
                Some((m, g)) => (m, g.trim()),
                None => (rest, ""),
            };
            let mode: AgentMode = mode.parse().map_err(|e| format!("{e}"))?;
            let goal = match mode {
                AgentMode::Goal if goal.is_empty() => return Err("start goal needs a goal text".into()),
                AgentMode::Goal => Some(goal.to_string()),
                AgentMode::FreeRoam => Some(goal.to_string()).filter(|g| !g.is_empty()),
            };
            AgentCommand::Start { mode, goal }
        }
        "stop" => AgentCommand::Stop,
        "pause" => AgentCommand::Pause,
        "resume" => AgentCommand::Resume,
        "restart" => AgentCommand::Restart,
        "window" => match rest {
            "" | "-" => AgentCommand::SetActiveWindow(None),
            hint => AgentCommand::SetActiveWindow(Some(hint.to_string())),
        },
        "hours" => {
            let bounds: Vec<&str> = rest.split_whitespace().collect();
            match bounds.as_slice() {
                [] | ["-"] => AgentCommand::SetActiveHours(None),
                [start, stop] => AgentCommand::SetActiveHours(Some(
                    ActiveHours::parse(start, stop).map_err(|e| e.to_string())?,
                )),
                _ => return Err("usage: hours <HH:MM> <HH:MM>".into()),
            }
        }
        "state" => return Ok(ConsoleCommand::ShowState),
        "snapshots" => return Ok(ConsoleCommand::ListSnapshots),
        "log" => {
            let limit = match rest {
                "" => 10,
                n => n.parse().map_err(|_| "usage: log [n]".to_string())?,
            };
            return Ok(ConsoleCommand::ShowLog(limit));
        }
        "prune" => {
            let keep = rest.parse().map_err(|_| "usage: prune <n>".to_string())?;
            return Ok(ConsoleCommand::Prune(keep));
        }
        "help" | "?" => return Ok(ConsoleCommand::Help),
        "quit" | "exit" => return Ok(ConsoleCommand::Quit),
        other => return Err(format!("unknown command '{other}' (try `help`)")),
    };
    Ok(ConsoleCommand::Agent(command))
}

/// Reads commands until `quit` or end of input. Failing queries are
/// reported on `out` and do not end the console.
pub fn run_console<R: BufRead, W: Write>(
    input: R,
    out: &mut W,
    handle: &AgentHandle,
    store: &StateStore,
    log: &ActionLog,
) -> DeskResult<()> {
    writeln!(out, "{HELP}")?;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_line(&line) {
            Ok(ConsoleCommand::Quit) => break,
            Ok(command) => command,
            Err(msg) => {
                writeln!(out, "error: {msg}")?;
                continue;
            }
        };
        if let Err(e) = dispatch(command, out, handle, store, log) {
            tracing::warn!(error = %e, line = %line.trim(), "console command failed");
            writeln!(out, "error: {e}")?;
        }
    }
    Ok(())
}

fn dispatch<W: Write>(
    command: ConsoleCommand,
    out: &mut W,
    handle: &AgentHandle,
    store: &StateStore,
    log: &ActionLog,
) -> DeskResult<()> {
    match command {
        ConsoleCommand::Agent(command) => {
            handle.send(command);
            writeln!(out, "ok")?;
        }
        ConsoleCommand::ShowState => {
            writeln!(out, "{}", serde_json::to_string_pretty(&handle.state())?)?;
        }
        ConsoleCommand::ListSnapshots => {
            for path in store.list_snapshots()? {
                writeln!(out, "{}", path.display())?;
            }
        }
        ConsoleCommand::ShowLog(limit) => {
            for entry in log.tail(limit)? {
                writeln!(out, "{} #{} {}", entry.ts.format("%Y-%m-%d %H:%M:%S"), entry.step, entry.summary)?;
            }
        }
        ConsoleCommand::Prune(keep) => {
            let removed = store.prune_snapshots(keep)?;
            writeln!(out, "removed {removed} snapshot(s)")?;
        }
        ConsoleCommand::Help => writeln!(out, "{HELP}")?,
        ConsoleCommand::Quit => {}
    }
    Ok(())
}
