//! Messages exchanged with the profiling agent.
//!
//! Every frame on the wire carries exactly one [`Command`] or one
//! [`Response`]. Commands travel in both directions; responses always answer
//! the single command the other side has in flight.

pub mod codec;
pub mod types;

use strum::{Display, FromRepr};

pub use types::{
    CalibrationData, ChangeableParams, CodeSelection, EventBufferDumped, HistogramEntry,
    InitiateProfiling, InstrumentationMode, InternalStats, MethodGroup, MethodName,
    MonitoredNumbers, ProfilingPoint, UnchangeableParams, VmProperties, N_TIMER_CONSTANTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    CheckConnection = 1,
    StartTargetApp = 2,
    SetChangeableInstrParams = 3,
    SetUnchangeableInstrParams = 4,
    InitiateProfiling = 5,
    InstrumentMethodGroup = 6,
    InstrumentReflection = 7,
    DeactivateInjectedCode = 8,
    GetVmProperties = 9,
    GetStoredCalibrationData = 10,
    RunCalibrationAndGetData = 11,
    GetClassId = 12,
    GetDefiningClassLoader = 13,
    GetMethodNamesForMethodIds = 14,
    RootClassLoaded = 15,
    ClassLoaded = 16,
    MethodInvokedFirstTime = 17,
    MethodLoaded = 18,
    ClassLoaderUnloading = 19,
    EventBufferDumped = 20,
    DumpExistingResults = 21,
    DumpExistingResultsLive = 22,
    ResultsAvailable = 23,
    ResetProfilerCollectors = 24,
    SuspendTargetApp = 25,
    ResumeTargetApp = 26,
    RunGc = 27,
    PrepareDetach = 28,
    Detach = 29,
    TerminateTargetJvm = 30,
    GetInternalStats = 31,
    GetHeapHistogram = 32,
    GetThreadLivenessStatus = 33,
    GetObjectAllocationResults = 34,
    GetCodeRegionCpuResults = 35,
    CpuResultsExist = 36,
    GetMonitoredNumbers = 37,
    TakeHeapDump = 38,
    TakeSnapshot = 39,
    Message = 40,
    ShutdownInitiated = 41,
    ShutdownOk = 42,
    ShutdownCompleted = 43,
    StillAlive = 44,
}

impl CommandKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Kinds that carry no payload and can go out through
    /// `send_simple_command`.
    pub fn is_simple(self) -> bool {
        Command::simple(self).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CheckConnection,
    StartTargetApp,
    SetChangeableInstrParams(ChangeableParams),
    SetUnchangeableInstrParams(UnchangeableParams),
    InitiateProfiling(InitiateProfiling),
    InstrumentMethodGroup(MethodGroup),
    InstrumentReflection,
    DeactivateInjectedCode,
    GetVmProperties,
    GetStoredCalibrationData,
    RunCalibrationAndGetData,
    GetClassId {
        class_name: String,
        loader_id: i32,
    },
    GetDefiningClassLoader {
        class_name: String,
        loader_id: i32,
    },
    GetMethodNamesForMethodIds {
        method_ids: Vec<i32>,
    },
    RootClassLoaded {
        class_names: Vec<String>,
        loader_ids: Vec<i32>,
        parent_loader_ids: Vec<i32>,
    },
    ClassLoaded {
        class_name: String,
        loader_id: i32,
        class_bytes: Vec<u8>,
    },
    MethodInvokedFirstTime {
        method_id: i32,
    },
    MethodLoaded {
        class_name: String,
        loader_id: i32,
        method_name: String,
        method_signature: String,
    },
    ClassLoaderUnloading,
    EventBufferDumped(EventBufferDumped),
    DumpExistingResults,
    DumpExistingResultsLive,
    ResultsAvailable,
    ResetProfilerCollectors,
    SuspendTargetApp,
    ResumeTargetApp,
    RunGc,
    PrepareDetach,
    Detach,
    TerminateTargetJvm,
    GetInternalStats,
    GetHeapHistogram,
    GetThreadLivenessStatus,
    GetObjectAllocationResults,
    GetCodeRegionCpuResults,
    CpuResultsExist,
    GetMonitoredNumbers,
    TakeHeapDump {
        output_file: String,
    },
    TakeSnapshot,
    Message {
        positive: bool,
        text: String,
    },
    ShutdownInitiated,
    ShutdownOk,
    ShutdownCompleted,
    StillAlive,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::CheckConnection => CommandKind::CheckConnection,
            Command::StartTargetApp => CommandKind::StartTargetApp,
            Command::SetChangeableInstrParams(_) => CommandKind::SetChangeableInstrParams,
            Command::SetUnchangeableInstrParams(_) => CommandKind::SetUnchangeableInstrParams,
            Command::InitiateProfiling(_) => CommandKind::InitiateProfiling,
            Command::InstrumentMethodGroup(_) => CommandKind::InstrumentMethodGroup,
            Command::InstrumentReflection => CommandKind::InstrumentReflection,
            Command::DeactivateInjectedCode => CommandKind::DeactivateInjectedCode,
            Command::GetVmProperties => CommandKind::GetVmProperties,
            Command::GetStoredCalibrationData => CommandKind::GetStoredCalibrationData,
            Command::RunCalibrationAndGetData => CommandKind::RunCalibrationAndGetData,
            Command::GetClassId { .. } => CommandKind::GetClassId,
            Command::GetDefiningClassLoader { .. } => CommandKind::GetDefiningClassLoader,
            Command::GetMethodNamesForMethodIds { .. } => CommandKind::GetMethodNamesForMethodIds,
            Command::RootClassLoaded { .. } => CommandKind::RootClassLoaded,
            Command::ClassLoaded { .. } => CommandKind::ClassLoaded,
            Command::MethodInvokedFirstTime { .. } => CommandKind::MethodInvokedFirstTime,
            Command::MethodLoaded { .. } => CommandKind::MethodLoaded,
            Command::ClassLoaderUnloading => CommandKind::ClassLoaderUnloading,
            Command::EventBufferDumped(_) => CommandKind::EventBufferDumped,
            Command::DumpExistingResults => CommandKind::DumpExistingResults,
            Command::DumpExistingResultsLive => CommandKind::DumpExistingResultsLive,
            Command::ResultsAvailable => CommandKind::ResultsAvailable,
            Command::ResetProfilerCollectors => CommandKind::ResetProfilerCollectors,
            Command::SuspendTargetApp => CommandKind::SuspendTargetApp,
            Command::ResumeTargetApp => CommandKind::ResumeTargetApp,
            Command::RunGc => CommandKind::RunGc,
            Command::PrepareDetach => CommandKind::PrepareDetach,
            Command::Detach => CommandKind::Detach,
            Command::TerminateTargetJvm => CommandKind::TerminateTargetJvm,
            Command::GetInternalStats => CommandKind::GetInternalStats,
            Command::GetHeapHistogram => CommandKind::GetHeapHistogram,
            Command::GetThreadLivenessStatus => CommandKind::GetThreadLivenessStatus,
            Command::GetObjectAllocationResults => CommandKind::GetObjectAllocationResults,
            Command::GetCodeRegionCpuResults => CommandKind::GetCodeRegionCpuResults,
            Command::CpuResultsExist => CommandKind::CpuResultsExist,
            Command::GetMonitoredNumbers => CommandKind::GetMonitoredNumbers,
            Command::TakeHeapDump { .. } => CommandKind::TakeHeapDump,
            Command::TakeSnapshot => CommandKind::TakeSnapshot,
            Command::Message { .. } => CommandKind::Message,
            Command::ShutdownInitiated => CommandKind::ShutdownInitiated,
            Command::ShutdownOk => CommandKind::ShutdownOk,
            Command::ShutdownCompleted => CommandKind::ShutdownCompleted,
            Command::StillAlive => CommandKind::StillAlive,
        }
    }

    /// The payload-free command of the given kind, if that kind has no payload.
    pub fn simple(kind: CommandKind) -> Option<Command> {
        let cmd = match kind {
            CommandKind::CheckConnection => Command::CheckConnection,
            CommandKind::StartTargetApp => Command::StartTargetApp,
            CommandKind::InstrumentReflection => Command::InstrumentReflection,
            CommandKind::DeactivateInjectedCode => Command::DeactivateInjectedCode,
            CommandKind::GetVmProperties => Command::GetVmProperties,
            CommandKind::GetStoredCalibrationData => Command::GetStoredCalibrationData,
            CommandKind::RunCalibrationAndGetData => Command::RunCalibrationAndGetData,
            CommandKind::ClassLoaderUnloading => Command::ClassLoaderUnloading,
            CommandKind::DumpExistingResults => Command::DumpExistingResults,
            CommandKind::DumpExistingResultsLive => Command::DumpExistingResultsLive,
            CommandKind::ResultsAvailable => Command::ResultsAvailable,
            CommandKind::ResetProfilerCollectors => Command::ResetProfilerCollectors,
            CommandKind::SuspendTargetApp => Command::SuspendTargetApp,
            CommandKind::ResumeTargetApp => Command::ResumeTargetApp,
            CommandKind::RunGc => Command::RunGc,
            CommandKind::PrepareDetach => Command::PrepareDetach,
            CommandKind::Detach => Command::Detach,
            CommandKind::TerminateTargetJvm => Command::TerminateTargetJvm,
            CommandKind::GetInternalStats => Command::GetInternalStats,
            CommandKind::GetHeapHistogram => Command::GetHeapHistogram,
            CommandKind::GetThreadLivenessStatus => Command::GetThreadLivenessStatus,
            CommandKind::GetObjectAllocationResults => Command::GetObjectAllocationResults,
            CommandKind::GetCodeRegionCpuResults => Command::GetCodeRegionCpuResults,
            CommandKind::CpuResultsExist => Command::CpuResultsExist,
            CommandKind::GetMonitoredNumbers => Command::GetMonitoredNumbers,
            CommandKind::TakeSnapshot => Command::TakeSnapshot,
            CommandKind::ShutdownInitiated => Command::ShutdownInitiated,
            CommandKind::ShutdownOk => Command::ShutdownOk,
            CommandKind::ShutdownCompleted => Command::ShutdownCompleted,
            CommandKind::StillAlive => Command::StillAlive,
            CommandKind::SetChangeableInstrParams
            | CommandKind::SetUnchangeableInstrParams
            | CommandKind::InitiateProfiling
            | CommandKind::InstrumentMethodGroup
            | CommandKind::GetClassId
            | CommandKind::GetDefiningClassLoader
            | CommandKind::GetMethodNamesForMethodIds
            | CommandKind::RootClassLoaded
            | CommandKind::ClassLoaded
            | CommandKind::MethodInvokedFirstTime
            | CommandKind::MethodLoaded
            | CommandKind::EventBufferDumped
            | CommandKind::TakeHeapDump
            | CommandKind::Message => return None,
        };
        Some(cmd)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Simple,
    ClassId { class_id: i32 },
    VmProperties(VmProperties),
    Calibration(CalibrationData),
    InternalStats(InternalStats),
    DumpResults { dump_abs_timestamp: i64 },
    MethodGroup(MethodGroup),
    HeapHistogram(Vec<HistogramEntry>),
    ThreadLiveness(Vec<u8>),
    ObjectAllocation(Vec<i32>),
    CodeRegionCpu(Vec<i64>),
    MethodNames(Vec<MethodName>),
    DefiningLoader { loader_id: i32 },
    MonitoredNumbers(MonitoredNumbers),
}

/// Answer to exactly one command. `yes` is the boolean verdict of the
/// command; an error message marks the command as failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub yes: bool,
    pub error: Option<String>,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(yes: bool) -> Self {
        Self {
            yes,
            error: None,
            body: ResponseBody::Simple,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            yes: false,
            error: Some(message.into()),
            body: ResponseBody::Simple,
        }
    }

    pub fn with_body(body: ResponseBody) -> Self {
        Self {
            yes: true,
            error: None,
            body,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Response(Response),
}
