//! Scripted stand-in for the profiler agent, speaking the real wire format
//! over a loopback socket.

use super::{AttachMode, ProfilerClient};
use crate::config::Config;
use crate::error::Result;
use crate::hooks::{
    CalibrationStore, Collaborators, EventBufferSource, FileEventBuffer, Instrumentor,
    ResultsProcessor, StatusHandler,
};
use crate::protocol::codec::{InboundClock, WireReceiver, WireSender};
use crate::protocol::{
    CalibrationData, Command, CommandKind, EventBufferDumped, InstrumentationMode,
    Message, MethodGroup, Response, ResponseBody, VmProperties, N_TIMER_CONSTANTS,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct MockTarget {
    pub port: u16,
    handle: JoinHandle<Vec<CommandKind>>,
}

impl MockTarget {
    /// Accepts one connection and runs `script` against it. The connection
    /// closes when the script returns.
    pub fn spawn<F>(script: F) -> Self
    where
        F: FnOnce(&mut MockAgent) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::Builder::new()
            .name("mock-target".to_string())
            .spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                let mut agent = MockAgent::new(stream);
                script(&mut agent);
                agent.log
            })
            .unwrap();

        Self { port, handle }
    }

    /// Waits for the script and returns the kinds of every command the
    /// client sent, in order.
    pub fn join(self) -> Vec<CommandKind> {
        self.handle.join().expect("mock target script failed")
    }
}

pub struct MockAgent {
    control: TcpStream,
    sender: WireSender<TcpStream>,
    receiver: WireReceiver<TcpStream>,
    log: Vec<CommandKind>,
}

impl MockAgent {
    fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).unwrap();
        let control = stream.try_clone().unwrap();
        let reader = stream.try_clone().unwrap();
        Self {
            control,
            sender: WireSender::new(stream),
            receiver: WireReceiver::new(reader, InboundClock::new()),
            log: Vec::new(),
        }
    }

    /// `None` once the client has closed the connection.
    fn next_message(&mut self) -> Option<Message> {
        let message = self.receiver.receive_command_or_response().ok()?;
        if let Some(Message::Command(cmd)) = &message {
            self.log.push(cmd.kind());
        }
        message
    }

    pub fn next_command(&mut self) -> Option<Command> {
        match self.next_message()? {
            Message::Command(cmd) => Some(cmd),
            Message::Response(resp) => panic!("expected a command, got {:?}", resp),
        }
    }

    pub fn next_response(&mut self) -> Response {
        match self.next_message() {
            Some(Message::Response(resp)) => resp,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    pub fn expect(&mut self, kind: CommandKind) -> Command {
        match self.next_command() {
            Some(cmd) if cmd.kind() == kind => cmd,
            other => panic!("expected {}, got {:?}", kind, other),
        }
    }

    pub fn reply(&mut self, resp: Response) {
        self.sender.send_complex_response(&resp).unwrap();
    }

    pub fn reply_vm_properties(&mut self) {
        self.reply(Response::with_body(ResponseBody::VmProperties(VmProperties {
            agent_version: super::client::CURRENT_AGENT_VERSION,
            agent_id: 1,
            jdk_version: "17".to_string(),
            java_command: "app.Main".to_string(),
            target_os: "linux".to_string(),
            max_heap_size: 256 << 20,
            ..VmProperties::default()
        })));
    }

    pub fn push(&mut self, cmd: Command) {
        self.sender.send_complex_command(&cmd).unwrap();
    }

    /// Writes bytes that need not form a valid frame.
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.control.write_all(bytes).unwrap();
    }

    pub fn push_and_wait(&mut self, cmd: Command) -> Response {
        self.push(cmd);
        self.next_response()
    }

    /// Answers everything `connect` sends, including the warm-up round.
    pub fn serve_handshake(&mut self) {
        self.expect(CommandKind::CheckConnection);
        self.reply(Response::ok(true));
        self.expect(CommandKind::GetVmProperties);
        self.reply_vm_properties();
        self.expect(CommandKind::InitiateProfiling);
        self.reply(Response::ok(true));

        let resp = self.push_and_wait(Command::RootClassLoaded {
            class_names: vec!["*FAKE_CLASS_1*".to_string(), "*FAKE_CLASS_2*".to_string()],
            loader_ids: vec![0, 0],
            parent_loader_ids: vec![0, 0],
        });
        match resp.body {
            ResponseBody::MethodGroup(group) => assert_eq!(group.class_names.len(), 2),
            other => panic!("unexpected warm-up answer {:?}", other),
        }
    }

    /// Fails if the client writes anything within `period`.
    pub fn assert_quiet(&mut self, period: Duration) {
        self.control.set_read_timeout(Some(period)).unwrap();
        let mut byte = [0u8; 1];
        match self.control.peek(&mut byte) {
            Ok(0) => {}
            Ok(_) => panic!("client wrote while it should have been waiting"),
            Err(e) => assert!(
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                "unexpected error {e}"
            ),
        }
        self.control.set_read_timeout(None).unwrap();
    }
}

pub fn test_config(port: u16) -> Config {
    Config {
        port,
        remote_host: Some("127.0.0.1".to_string()),
        connect_retry_ms: 10,
        connect_attempts: 50,
        warmup_poll_ms: 10,
        warmup_attempts: 20,
        liveness_interval_ms: 2000,
        close_settle_ms: 10,
        ..Config::default()
    }
}

pub fn sample_calibration() -> CalibrationData {
    CalibrationData {
        method_entry_exit_call_time: vec![1.0; N_TIMER_CONSTANTS],
        method_entry_exit_inner_time: vec![0.5; N_TIMER_CONSTANTS],
        method_entry_exit_outer_time: vec![0.5; N_TIMER_CONSTANTS],
        timer_counts_in_second: vec![1_000_000_000, 1_000_000],
    }
}

pub fn connected_client(config: Config, hooks: &TestHooks) -> ProfilerClient {
    let client = ProfilerClient::new(config, test_collaborators(hooks));
    assert!(client.connect(AttachMode::Dynamic, false, &AtomicBool::new(false)));
    client
}

pub fn test_collaborators(hooks: &TestHooks) -> Collaborators {
    Collaborators {
        status: hooks.status.clone(),
        instrumentor: hooks.instrumentor.clone(),
        results: hooks.results.clone(),
        buffers: hooks.buffers.clone(),
        calibration: hooks.calibration.clone(),
    }
}

#[derive(Clone, Default)]
pub struct TestHooks {
    pub status: Arc<RecordingStatus>,
    pub instrumentor: Arc<ScriptedInstrumentor>,
    pub results: Arc<RecordingResults>,
    pub buffers: Arc<CountingBuffers>,
    pub calibration: Arc<MemoryCalibrationStore>,
}

impl TestHooks {
    /// Hooks for a local session, with calibration data for the mock's JDK.
    pub fn with_calibration() -> Self {
        let hooks = Self::default();
        hooks.calibration.save("jdk17", &sample_calibration()).unwrap();
        hooks
    }

    pub fn errors(&self) -> Vec<String> {
        self.status.errors.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.status.warnings.lock().clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.status.notifications.lock().clone()
    }

    /// Thread name and size of every processed buffer.
    pub fn processed(&self) -> Vec<(String, usize)> {
        self.results.processed.lock().clone()
    }

    pub fn unloadings(&self) -> usize {
        self.results.unloadings.load(Ordering::SeqCst)
    }

    pub fn buffer_reads(&self) -> usize {
        self.buffers.reads.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    notifications: Mutex<Vec<String>>,
}

impl StatusHandler for RecordingStatus {
    fn display_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn display_warning(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }

    fn display_notification(&self, message: &str) {
        self.notifications.lock().push(message.to_string());
    }
}

#[derive(Default)]
pub struct ScriptedInstrumentor {
    lookup_loader: AtomicBool,
    method_count: AtomicUsize,
    clears: AtomicUsize,
    root_modes: Mutex<Vec<InstrumentationMode>>,
    unprofile: Mutex<Option<MethodGroup>>,
}

impl ScriptedInstrumentor {
    /// Makes `root_class_loaded` ask the agent for the defining loader, a
    /// nested round trip from the executor thread.
    pub fn lookup_defining_loader(&self, enabled: bool) {
        self.lookup_loader.store(enabled, Ordering::SeqCst);
    }

    pub fn set_method_count(&self, count: usize) {
        self.method_count.store(count, Ordering::SeqCst);
    }

    /// Group handed out by `unprofile_classes`.
    pub fn set_unprofile_group(&self, group: Option<MethodGroup>) {
        *self.unprofile.lock() = group;
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    /// Session mode observed by each root class event.
    pub fn root_modes(&self) -> Vec<InstrumentationMode> {
        self.root_modes.lock().clone()
    }
}

impl Instrumentor for ScriptedInstrumentor {
    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn root_class_loaded(
        &self,
        client: &ProfilerClient,
        class_names: &[String],
        loader_ids: &[i32],
        _parent_loader_ids: &[i32],
    ) -> Result<MethodGroup> {
        self.root_modes.lock().push(client.current_mode());

        let mut loaders = loader_ids.to_vec();
        if self.lookup_loader.load(Ordering::SeqCst) {
            for (name, loader) in class_names.iter().zip(loaders.iter_mut()) {
                *loader = client.get_defining_class_loader_id(name, *loader)?;
            }
        }

        Ok(MethodGroup {
            class_names: class_names.to_vec(),
            bytecodes: vec![vec![0xCA, 0xFE]; class_names.len()],
            loader_ids: loaders,
            base_method_id: 1,
        })
    }

    fn class_id(&self, class_name: &str, _loader_id: i32) -> i32 {
        if class_name == "app.Known" {
            42
        } else {
            -1
        }
    }

    fn unprofile_classes(&self, _unprofiled: &[bool]) -> Option<MethodGroup> {
        self.unprofile.lock().clone()
    }

    fn instrumented_methods_count(&self) -> usize {
        self.method_count.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingResults {
    processed: Mutex<Vec<(String, usize)>>,
    unloadings: AtomicUsize,
    starts: AtomicUsize,
}

impl RecordingResults {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl ResultsProcessor for RecordingResults {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn data_ready(&self, buffer: &[u8], _mode: InstrumentationMode) {
        let thread = thread::current().name().unwrap_or("unnamed").to_string();
        self.processed.lock().push((thread, buffer.len()));
    }

    fn class_loader_unloading(&self) {
        self.unloadings.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct CountingBuffers {
    inner: FileEventBuffer,
    reads: AtomicUsize,
}

impl EventBufferSource for CountingBuffers {
    fn read(&self, dump: &EventBufferDumped) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(dump)
    }

    fn discard(&self) {
        self.inner.discard();
    }
}

#[derive(Default)]
pub struct MemoryCalibrationStore {
    saved: Mutex<HashMap<String, CalibrationData>>,
}

impl CalibrationStore for MemoryCalibrationStore {
    fn load(&self, jdk_version: &str) -> Result<Option<CalibrationData>> {
        Ok(self.saved.lock().get(jdk_version).cloned())
    }

    fn save(&self, jdk_version: &str, data: &CalibrationData) -> Result<()> {
        self.saved
            .lock()
            .insert(jdk_version.to_string(), data.clone());
        Ok(())
    }
}
