//! Scripted stand-in minions for exercising the engine without a real binary.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;

use super::process::{MinionRole, WorkerLauncher};
use super::protocol::{MinionMessage, ParentMessage, read_frame_async, write_frame_async};
use crate::mutation::MutationIdentifier;

type Reply = Box<dyn FnOnce(&ParentMessage) -> Vec<MinionMessage> + Send>;

/// What one fake minion does with the work it is handed.
pub(crate) struct Script {
    reply: Reply,
    hang_up: bool,
}

impl Script {
    /// Send the replies, then close the connection.
    pub(crate) fn reply(
        reply: impl FnOnce(&ParentMessage) -> Vec<MinionMessage> + Send + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            hang_up: true,
        }
    }

    /// Send the replies, then keep the connection open until the engine drops it.
    pub(crate) fn stall(
        reply: impl FnOnce(&ParentMessage) -> Vec<MinionMessage> + Send + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            hang_up: false,
        }
    }
}

/// Mutant ids of a unit assignment, in the order they were handed out.
pub(crate) fn assigned_ids(message: &ParentMessage) -> Vec<MutationIdentifier> {
    match message {
        ParentMessage::Assign(unit) => unit.mutants.iter().map(|m| m.id.clone()).collect(),
        ParentMessage::CoverageAssign(_) => Vec::new(),
    }
}

/// Plays one [`Script`] per launched minion. The real process is a short
/// `sleep` and the conversation happens on a tokio task.
pub(crate) struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    received: Arc<Mutex<Vec<ParentMessage>>>,
}

impl ScriptedLauncher {
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every message the fake minions were handed so far.
    pub(crate) fn received(&self) -> Vec<ParentMessage> {
        self.received.lock().expect("received log should not be poisoned").clone()
    }

    /// Wait until `count` minions have been handed work.
    pub(crate) async fn wait_for_work(&self, count: usize) {
        for _ in 0..500 {
            if self.received().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake minions never received {count} assignment(s)");
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn command(&self, _: MinionRole, port: u16) -> Command {
        let script = self
            .scripts
            .lock()
            .expect("script queue should not be poisoned")
            .pop_front();
        tokio::spawn(play(port, script, self.received.clone()));

        let mut command = Command::new("sleep");
        command.arg("1");
        command
    }
}

async fn play(port: u16, script: Option<Script>, received: Arc<Mutex<Vec<ParentMessage>>>) {
    let Some(script) = script else {
        return;
    };
    let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await else {
        return;
    };
    let Ok(Some(message)) = read_frame_async::<_, ParentMessage>(&mut stream).await else {
        return;
    };
    let replies = (script.reply)(&message);
    received
        .lock()
        .expect("received log should not be poisoned")
        .push(message);
    for reply in replies {
        if write_frame_async(&mut stream, &reply).await.is_err() {
            return;
        }
    }
    if !script.hang_up {
        let _ = read_frame_async::<_, ParentMessage>(&mut stream).await;
    }
}
