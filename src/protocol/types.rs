use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, FromRepr};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum InstrumentationMode {
    #[default]
    None = 0,
    CodeRegion = 1,
    RecursiveFull = 2,
    RecursiveSampled = 3,
    ObjectAllocations = 4,
    ObjectLiveness = 5,
    NoneSampling = 6,
    NoneMemorySampling = 7,
}

impl InstrumentationMode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_recursive_cpu(self) -> bool {
        matches!(
            self,
            InstrumentationMode::RecursiveFull | InstrumentationMode::RecursiveSampled
        )
    }

    pub fn is_memory(self) -> bool {
        matches!(
            self,
            InstrumentationMode::ObjectAllocations | InstrumentationMode::ObjectLiveness
        )
    }

    /// Modes whose results are meaningless without timer calibration data.
    pub fn needs_calibration(self) -> bool {
        self == InstrumentationMode::CodeRegion || self.is_recursive_cpu()
    }

    /// Modes that keep no injected code in the target.
    pub fn is_uninstrumented(self) -> bool {
        matches!(
            self,
            InstrumentationMode::None | InstrumentationMode::NoneSampling
        )
    }
}

/// User-configured marker the agent reports on. Ordered by id because the
/// agent binary-searches the id table it receives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfilingPoint {
    pub id: i32,
    pub handler_class: String,
    #[serde(default)]
    pub info: String,
}

/// Source selection handed to the instrumentor for CPU and code region modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSelection {
    pub class_name: String,
    #[serde(default)]
    pub method_name: Option<String>,
    #[serde(default)]
    pub method_signature: Option<String>,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
}

impl CodeSelection {
    pub fn class(name: impl Into<String>) -> Self {
        Self {
            class_name: name.into(),
            method_name: None,
            method_signature: None,
            start_line: None,
            end_line: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitiateProfiling {
    pub mode: InstrumentationMode,
    pub root_classes: Vec<String>,
    pub profiling_point_ids: Vec<i32>,
    pub profiling_point_handlers: Vec<String>,
    pub profiling_point_infos: Vec<String>,
    pub instr_spawned_threads: bool,
    pub start_profiling_points_active: bool,
}

impl InitiateProfiling {
    pub fn bare(mode: InstrumentationMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_root(mode: InstrumentationMode, root_class: impl Into<String>) -> Self {
        Self {
            mode,
            root_classes: vec![root_class.into()],
            ..Default::default()
        }
    }

    /// Builds the startup command, laying the profiling points out sorted by id.
    pub fn with_points(
        mode: InstrumentationMode,
        root_classes: Vec<String>,
        points: &[ProfilingPoint],
        instr_spawned_threads: bool,
        start_profiling_points_active: bool,
    ) -> Self {
        let mut sorted = points.to_vec();
        sorted.sort();

        Self {
            mode,
            root_classes,
            profiling_point_ids: sorted.iter().map(|p| p.id).collect(),
            profiling_point_handlers: sorted.iter().map(|p| p.handler_class.clone()).collect(),
            profiling_point_infos: sorted.iter().map(|p| p.info.clone()).collect(),
            instr_spawned_threads,
            start_profiling_points_active,
        }
    }
}

/// Bytecode for a group of classes, sent in either direction: as a push
/// reply to a class-load event or as a command that (de)instruments methods.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodGroup {
    pub class_names: Vec<String>,
    pub loader_ids: Vec<i32>,
    pub bytecodes: Vec<Vec<u8>>,
    pub base_method_id: i32,
}

impl MethodGroup {
    pub fn is_empty(&self) -> bool {
        self.class_names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeableParams {
    pub lock_contention_monitoring: bool,
    pub profiled_threads_limit: i32,
    pub sampling_interval: i32,
    pub alloc_track_every: i32,
    pub alloc_stack_trace_limit: i32,
    pub run_gc_on_get_results: bool,
    pub exclude_wait_time: bool,
    pub exclude_sleep_time: bool,
    pub threads_sampling: bool,
    pub sampling_frequency: i32,
}

impl Default for ChangeableParams {
    fn default() -> Self {
        Self {
            lock_contention_monitoring: false,
            profiled_threads_limit: 32,
            sampling_interval: 10,
            alloc_track_every: 10,
            alloc_stack_trace_limit: -5,
            run_gc_on_get_results: true,
            exclude_wait_time: true,
            exclude_sleep_time: true,
            threads_sampling: true,
            sampling_frequency: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnchangeableParams {
    pub remote_profiling: bool,
    pub absolute_timer: bool,
    pub thread_cpu_timer: bool,
    pub instr_scheme: i32,
    pub code_region_buffer_size: i32,
}

impl Default for UnchangeableParams {
    fn default() -> Self {
        Self {
            remote_profiling: false,
            absolute_timer: true,
            thread_cpu_timer: false,
            instr_scheme: 1,
            code_region_buffer_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventBufferDumped {
    pub buffer_size: u32,
    /// Name of the staged buffer file on a local target, empty when remote.
    pub buffer_name: String,
    /// Inline buffer bytes on a remote target.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VmProperties {
    pub agent_version: i32,
    pub agent_id: i32,
    pub jdk_version: String,
    pub jvm_arguments: String,
    pub java_command: String,
    pub target_os: String,
    pub working_dir: String,
    pub class_path: String,
    pub max_heap_size: i64,
    pub startup_time_millis: i64,
    pub startup_time_counts: i64,
}

pub const N_TIMER_CONSTANTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationData {
    pub method_entry_exit_call_time: Vec<f64>,
    pub method_entry_exit_inner_time: Vec<f64>,
    pub method_entry_exit_outer_time: Vec<f64>,
    pub timer_counts_in_second: Vec<i64>,
}

impl CalibrationData {
    pub fn is_empty(&self) -> bool {
        self.timer_counts_in_second.first().copied().unwrap_or(0) == 0
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InternalStats {
    pub n_total_instr_methods: i32,
    pub n_class_loads: i32,
    pub n_first_method_invocations: i32,
    pub n_non_empty_instr_method_group_responses: i32,
    pub n_empty_instr_method_group_responses: i32,
    pub n_single_method_instr_method_group_responses: i32,
    pub client_instr_time: f64,
    pub client_data_proc_time: f64,
    pub total_hotswapping_time: f64,
    pub average_hotswapping_time: f64,
    pub min_hotswapping_time: f64,
    pub max_hotswapping_time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramEntry {
    pub class_name: String,
    pub instances: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodName {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MonitoredNumbers {
    pub free_memory: i64,
    pub total_memory: i64,
    pub user_threads: i32,
    pub system_threads: i32,
    pub surviving_generations: i32,
    pub relative_gc_time: f64,
    pub last_gc_pause_ms: i64,
}
