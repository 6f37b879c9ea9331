//! In-memory backend for deterministic tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::backend::{
    BackendError, BackendEvent, BackendHandle, ExitStatus, ProcessBackend, SpawnSpec,
};

/// A fake process driven by the test.
pub struct ScriptedProcess {
    pub spec: SpawnSpec,
    events: mpsc::UnboundedSender<BackendEvent>,
    input: Mutex<Vec<u8>>,
    size: Mutex<(u16, u16)>,
    running: AtomicBool,
    kills: Mutex<u32>,
}

impl ScriptedProcess {
    /// Produce output as if the process wrote it.
    pub fn emit(&self, data: &[u8]) {
        let _ = self.events.send(BackendEvent::Data(data.to_vec()));
    }

    /// Exit with a code.
    pub fn exit(&self, code: u32) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(BackendEvent::Exit(ExitStatus::with_code(code)));
        }
    }

    /// Die without the exit notification having arrived yet.
    pub fn crash_silently(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap()
    }

    pub fn kill_count(&self) -> u32 {
        *self.kills.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct ScriptedHandle(Arc<ScriptedProcess>);

impl BackendHandle for ScriptedHandle {
    fn write(&self, data: &[u8]) -> Result<(), BackendError> {
        if !self.0.is_running() {
            return Err(BackendError::Closed);
        }
        self.0.input.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        if !self.0.is_running() {
            return Err(BackendError::Closed);
        }
        *self.0.size.lock().unwrap() = (cols, rows);
        Ok(())
    }

    fn kill(&self) {
        *self.0.kills.lock().unwrap() += 1;
        if self.0.running.swap(false, Ordering::SeqCst) {
            let _ = self
                .0
                .events
                .send(BackendEvent::Exit(ExitStatus::with_signal("SIGKILL")));
        }
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_running(&self) -> bool {
        self.0.is_running()
    }
}

/// Backend whose processes are [`ScriptedProcess`]es.
#[derive(Default)]
pub struct ScriptedBackend {
    spawned: Mutex<Vec<Arc<ScriptedProcess>>>,
    fail_next: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next spawn fail.
    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The n-th spawned process.
    pub fn process(&self, n: usize) -> Arc<ScriptedProcess> {
        Arc::clone(&self.spawned.lock().unwrap()[n])
    }

    /// The most recently spawned process.
    pub fn last(&self) -> Arc<ScriptedProcess> {
        let spawned = self.spawned.lock().unwrap();
        Arc::clone(spawned.last().expect("nothing spawned"))
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

impl ProcessBackend for ScriptedBackend {
    type Handle = ScriptedHandle;

    fn spawn(
        &self,
        spec: &SpawnSpec,
    ) -> Result<(ScriptedHandle, mpsc::UnboundedReceiver<BackendEvent>), BackendError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Spawn("scripted spawn failure".to_string()));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let process = Arc::new(ScriptedProcess {
            spec: spec.clone(),
            events,
            input: Mutex::new(Vec::new()),
            size: Mutex::new((spec.cols, spec.rows)),
            running: AtomicBool::new(true),
            kills: Mutex::new(0),
        });
        self.spawned.lock().unwrap().push(Arc::clone(&process));
        Ok((ScriptedHandle(process), rx))
    }
}
