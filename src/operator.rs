//! # Operator commands
//!
//! Keys are read from stdin, one line at a time; every character of a line is a command. In a
//! terminal, type the keys then press enter.
//!
//! | Key | Command |
//! |-----|---------|
//! | `a` / `d` | offset X -0.1 / +0.1 m |
//! | `s` / `w` | offset Y -0.1 / +0.1 m |
//! | `z` / `x` | offset Z -0.1 / +0.1 m |
//! | `1` .. `9` | select controller body |
//! | `q` / `esc` | quit |

use std::io::BufRead;

use tokio::sync::mpsc;

const NUDGE_STEP: f32 = 0.1;
const ESCAPE: char = '\x1b';

/// Command typed by the operator
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    /// Shift the offset from the controller body, metres
    Nudge {
        /// X shift
        dx: f32,
        /// Y shift
        dy: f32,
        /// Z shift
        dz: f32,
    },
    /// Select a controller body, 0 based
    SelectController(usize),
    /// Land and end the flight
    Quit,
}

impl OperatorCommand {
    /// Command bound to a key, if any
    pub fn from_key(key: char) -> Option<Self> {
        let nudge = |dx, dy, dz| Some(OperatorCommand::Nudge { dx, dy, dz });
        match key.to_ascii_lowercase() {
            'a' => nudge(-NUDGE_STEP, 0.0, 0.0),
            'd' => nudge(NUDGE_STEP, 0.0, 0.0),
            's' => nudge(0.0, -NUDGE_STEP, 0.0),
            'w' => nudge(0.0, NUDGE_STEP, 0.0),
            'z' => nudge(0.0, 0.0, -NUDGE_STEP),
            'x' => nudge(0.0, 0.0, NUDGE_STEP),
            'q' | ESCAPE => Some(OperatorCommand::Quit),
            digit @ '1'..='9' => Some(OperatorCommand::SelectController(digit as usize - '1' as usize)),
            _ => None,
        }
    }
}

/// Read commands from an input until it ends or the receiver is dropped
///
/// Blocking, must run outside of the async runtime.
pub fn read_commands<R: BufRead>(input: R, commands: &mpsc::Sender<OperatorCommand>) -> anyhow::Result<()> {
    for line in input.lines() {
        let line = line?;
        for key in line.chars().filter(|c| !c.is_whitespace()) {
            match OperatorCommand::from_key(key) {
                Some(command) => {
                    if commands.blocking_send(command).is_err() {
                        return Ok(());
                    }
                }
                None => log::debug!("Ignoring key {:?}", key),
            }
        }
    }
    Ok(())
}

/// Read commands from stdin on a dedicated thread
///
/// The thread is not part of the runtime: a pending read does not delay its shutdown, and the
/// thread ends on the first key typed after the receiver is dropped.
pub fn spawn_stdin() -> mpsc::Receiver<OperatorCommand> {
    let (commands, receiver) = mpsc::channel(16);
    let reader = std::thread::Builder::new().name("operator".to_string()).spawn(move || {
        if let Err(e) = read_commands(std::io::stdin().lock(), &commands) {
            log::warn!("Cannot read operator commands: {}", e);
        }
    });
    if let Err(e) = reader {
        log::warn!("Cannot start operator input thread: {}", e);
    }
    receiver
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bindings() {
        assert_eq!(OperatorCommand::from_key('a'), Some(OperatorCommand::Nudge { dx: -0.1, dy: 0.0, dz: 0.0 }));
        assert_eq!(OperatorCommand::from_key('W'), Some(OperatorCommand::Nudge { dx: 0.0, dy: 0.1, dz: 0.0 }));
        assert_eq!(OperatorCommand::from_key('x'), Some(OperatorCommand::Nudge { dx: 0.0, dy: 0.0, dz: 0.1 }));
        assert_eq!(OperatorCommand::from_key('1'), Some(OperatorCommand::SelectController(0)));
        assert_eq!(OperatorCommand::from_key('3'), Some(OperatorCommand::SelectController(2)));
        assert_eq!(OperatorCommand::from_key('\x1b'), Some(OperatorCommand::Quit));
        assert_eq!(OperatorCommand::from_key('0'), None);
        assert_eq!(OperatorCommand::from_key('p'), None);
    }

    #[test]
    fn every_key_of_a_line_is_a_command() {
        let (tx, mut rx) = mpsc::channel(16);
        read_commands(&b"dd 2\nq\n"[..], &tx).unwrap();
        drop(tx);

        let mut commands = Vec::new();
        while let Some(command) = rx.blocking_recv() {
            commands.push(command);
        }
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[2], OperatorCommand::SelectController(1));
        assert_eq!(commands[3], OperatorCommand::Quit);
    }

    #[test]
    fn reading_stops_when_receiver_is_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let thread = std::thread::spawn(move || read_commands(&b"aaaa\nq\n"[..], &tx));
        assert!(thread.join().unwrap().is_ok());
    }
}
