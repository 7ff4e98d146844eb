//! Framed binary encoding of [`Message`]s.
//!
//! Frame layout: `u32` body length (big endian) followed by the body. The body
//! starts with a tag byte, [`TAG_COMMAND`] or [`TAG_RESPONSE`]. Commands
//! continue with their kind code and payload; responses with the verdict,
//! an optional error message, a body code and the body payload.

use super::{
    CalibrationData, ChangeableParams, Command, CommandKind, EventBufferDumped, HistogramEntry,
    InitiateProfiling, InstrumentationMode, InternalStats, Message, MethodGroup, MethodName,
    MonitoredNumbers, Response, ResponseBody, UnchangeableParams, VmProperties,
};
use crate::error::{Result, SessionError};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

pub const TAG_COMMAND: u8 = 1;
pub const TAG_RESPONSE: u8 = 2;
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_strings(&mut self, values: &[String]) {
        self.write_u32(values.len() as u32);
        for v in values {
            self.write_string(v);
        }
    }

    pub fn write_i32s(&mut self, values: &[i32]) {
        self.write_u32(values.len() as u32);
        for v in values {
            self.write_i32(*v);
        }
    }

    pub fn write_i64s(&mut self, values: &[i64]) {
        self.write_u32(values.len() as u32);
        for v in values {
            self.write_i64(*v);
        }
    }

    pub fn write_f64s(&mut self, values: &[f64]) {
        self.write_u32(values.len() as u32);
        for v in values {
            self.write_f64(*v);
        }
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| SessionError::Protocol("unexpected end of frame".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_exact(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(self.read_array()?)))
    }

    /// Reads an element count, rejecting counts that cannot fit in the rest
    /// of the frame given the minimum element size.
    fn read_count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_element_size.max(1)) > self.remaining() {
            return Err(SessionError::Protocol(format!(
                "element count {count} exceeds frame size"
            )));
        }
        Ok(count)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_count(1)?;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SessionError::Protocol("string was not valid UTF-8".to_string()))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count(1)?;
        Ok(self.read_exact(len)?.to_vec())
    }

    pub fn read_strings(&mut self) -> Result<Vec<String>> {
        let count = self.read_count(4)?;
        (0..count).map(|_| self.read_string()).collect()
    }

    pub fn read_i32s(&mut self) -> Result<Vec<i32>> {
        let count = self.read_count(4)?;
        (0..count).map(|_| self.read_i32()).collect()
    }

    pub fn read_i64s(&mut self) -> Result<Vec<i64>> {
        let count = self.read_count(8)?;
        (0..count).map(|_| self.read_i64()).collect()
    }

    pub fn read_f64s(&mut self) -> Result<Vec<f64>> {
        let count = self.read_count(8)?;
        (0..count).map(|_| self.read_f64()).collect()
    }

    pub fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(SessionError::Protocol(format!(
                "{} trailing bytes in frame",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn write_method_group(w: &mut WireWriter, group: &MethodGroup) {
    w.write_strings(&group.class_names);
    w.write_i32s(&group.loader_ids);
    w.write_u32(group.bytecodes.len() as u32);
    for code in &group.bytecodes {
        w.write_bytes(code);
    }
    w.write_i32(group.base_method_id);
}

fn read_method_group(r: &mut WireReader<'_>) -> Result<MethodGroup> {
    let class_names = r.read_strings()?;
    let loader_ids = r.read_i32s()?;
    let count = r.read_count(4)?;
    let bytecodes = (0..count)
        .map(|_| r.read_bytes())
        .collect::<Result<Vec<_>>>()?;
    let base_method_id = r.read_i32()?;
    Ok(MethodGroup {
        class_names,
        loader_ids,
        bytecodes,
        base_method_id,
    })
}

fn read_mode(r: &mut WireReader<'_>) -> Result<InstrumentationMode> {
    let code = r.read_u8()?;
    InstrumentationMode::from_repr(code)
        .ok_or_else(|| SessionError::Protocol(format!("unknown instrumentation mode {code}")))
}

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u8(TAG_COMMAND);
    w.write_u8(cmd.kind().code());

    match cmd {
        Command::SetChangeableInstrParams(p) => {
            w.write_bool(p.lock_contention_monitoring);
            w.write_i32(p.profiled_threads_limit);
            w.write_i32(p.sampling_interval);
            w.write_i32(p.alloc_track_every);
            w.write_i32(p.alloc_stack_trace_limit);
            w.write_bool(p.run_gc_on_get_results);
            w.write_bool(p.exclude_wait_time);
            w.write_bool(p.exclude_sleep_time);
            w.write_bool(p.threads_sampling);
            w.write_i32(p.sampling_frequency);
        }
        Command::SetUnchangeableInstrParams(p) => {
            w.write_bool(p.remote_profiling);
            w.write_bool(p.absolute_timer);
            w.write_bool(p.thread_cpu_timer);
            w.write_i32(p.instr_scheme);
            w.write_i32(p.code_region_buffer_size);
        }
        Command::InitiateProfiling(p) => {
            w.write_u8(p.mode.code());
            w.write_strings(&p.root_classes);
            w.write_i32s(&p.profiling_point_ids);
            w.write_strings(&p.profiling_point_handlers);
            w.write_strings(&p.profiling_point_infos);
            w.write_bool(p.instr_spawned_threads);
            w.write_bool(p.start_profiling_points_active);
        }
        Command::InstrumentMethodGroup(group) => write_method_group(&mut w, group),
        Command::GetClassId {
            class_name,
            loader_id,
        }
        | Command::GetDefiningClassLoader {
            class_name,
            loader_id,
        } => {
            w.write_string(class_name);
            w.write_i32(*loader_id);
        }
        Command::GetMethodNamesForMethodIds { method_ids } => w.write_i32s(method_ids),
        Command::RootClassLoaded {
            class_names,
            loader_ids,
            parent_loader_ids,
        } => {
            w.write_strings(class_names);
            w.write_i32s(loader_ids);
            w.write_i32s(parent_loader_ids);
        }
        Command::ClassLoaded {
            class_name,
            loader_id,
            class_bytes,
        } => {
            w.write_string(class_name);
            w.write_i32(*loader_id);
            w.write_bytes(class_bytes);
        }
        Command::MethodInvokedFirstTime { method_id } => w.write_i32(*method_id),
        Command::MethodLoaded {
            class_name,
            loader_id,
            method_name,
            method_signature,
        } => {
            w.write_string(class_name);
            w.write_i32(*loader_id);
            w.write_string(method_name);
            w.write_string(method_signature);
        }
        Command::EventBufferDumped(dump) => {
            w.write_u32(dump.buffer_size);
            w.write_string(&dump.buffer_name);
            w.write_bytes(&dump.data);
        }
        Command::TakeHeapDump { output_file } => w.write_string(output_file),
        Command::Message { positive, text } => {
            w.write_bool(*positive);
            w.write_string(text);
        }
        Command::CheckConnection
        | Command::StartTargetApp
        | Command::InstrumentReflection
        | Command::DeactivateInjectedCode
        | Command::GetVmProperties
        | Command::GetStoredCalibrationData
        | Command::RunCalibrationAndGetData
        | Command::ClassLoaderUnloading
        | Command::DumpExistingResults
        | Command::DumpExistingResultsLive
        | Command::ResultsAvailable
        | Command::ResetProfilerCollectors
        | Command::SuspendTargetApp
        | Command::ResumeTargetApp
        | Command::RunGc
        | Command::PrepareDetach
        | Command::Detach
        | Command::TerminateTargetJvm
        | Command::GetInternalStats
        | Command::GetHeapHistogram
        | Command::GetThreadLivenessStatus
        | Command::GetObjectAllocationResults
        | Command::GetCodeRegionCpuResults
        | Command::CpuResultsExist
        | Command::GetMonitoredNumbers
        | Command::TakeSnapshot
        | Command::ShutdownInitiated
        | Command::ShutdownOk
        | Command::ShutdownCompleted
        | Command::StillAlive => {}
    }

    w.into_vec()
}

fn decode_command(r: &mut WireReader<'_>) -> Result<Command> {
    let code = r.read_u8()?;
    let kind = CommandKind::from_repr(code)
        .ok_or_else(|| SessionError::Protocol(format!("unknown command kind {code}")))?;

    if let Some(cmd) = Command::simple(kind) {
        return Ok(cmd);
    }

    let cmd = match kind {
        CommandKind::SetChangeableInstrParams => {
            Command::SetChangeableInstrParams(ChangeableParams {
                lock_contention_monitoring: r.read_bool()?,
                profiled_threads_limit: r.read_i32()?,
                sampling_interval: r.read_i32()?,
                alloc_track_every: r.read_i32()?,
                alloc_stack_trace_limit: r.read_i32()?,
                run_gc_on_get_results: r.read_bool()?,
                exclude_wait_time: r.read_bool()?,
                exclude_sleep_time: r.read_bool()?,
                threads_sampling: r.read_bool()?,
                sampling_frequency: r.read_i32()?,
            })
        }
        CommandKind::SetUnchangeableInstrParams => {
            Command::SetUnchangeableInstrParams(UnchangeableParams {
                remote_profiling: r.read_bool()?,
                absolute_timer: r.read_bool()?,
                thread_cpu_timer: r.read_bool()?,
                instr_scheme: r.read_i32()?,
                code_region_buffer_size: r.read_i32()?,
            })
        }
        CommandKind::InitiateProfiling => Command::InitiateProfiling(InitiateProfiling {
            mode: read_mode(r)?,
            root_classes: r.read_strings()?,
            profiling_point_ids: r.read_i32s()?,
            profiling_point_handlers: r.read_strings()?,
            profiling_point_infos: r.read_strings()?,
            instr_spawned_threads: r.read_bool()?,
            start_profiling_points_active: r.read_bool()?,
        }),
        CommandKind::InstrumentMethodGroup => Command::InstrumentMethodGroup(read_method_group(r)?),
        CommandKind::GetClassId => Command::GetClassId {
            class_name: r.read_string()?,
            loader_id: r.read_i32()?,
        },
        CommandKind::GetDefiningClassLoader => Command::GetDefiningClassLoader {
            class_name: r.read_string()?,
            loader_id: r.read_i32()?,
        },
        CommandKind::GetMethodNamesForMethodIds => Command::GetMethodNamesForMethodIds {
            method_ids: r.read_i32s()?,
        },
        CommandKind::RootClassLoaded => Command::RootClassLoaded {
            class_names: r.read_strings()?,
            loader_ids: r.read_i32s()?,
            parent_loader_ids: r.read_i32s()?,
        },
        CommandKind::ClassLoaded => Command::ClassLoaded {
            class_name: r.read_string()?,
            loader_id: r.read_i32()?,
            class_bytes: r.read_bytes()?,
        },
        CommandKind::MethodInvokedFirstTime => Command::MethodInvokedFirstTime {
            method_id: r.read_i32()?,
        },
        CommandKind::MethodLoaded => Command::MethodLoaded {
            class_name: r.read_string()?,
            loader_id: r.read_i32()?,
            method_name: r.read_string()?,
            method_signature: r.read_string()?,
        },
        CommandKind::EventBufferDumped => Command::EventBufferDumped(EventBufferDumped {
            buffer_size: r.read_u32()?,
            buffer_name: r.read_string()?,
            data: r.read_bytes()?,
        }),
        CommandKind::TakeHeapDump => Command::TakeHeapDump {
            output_file: r.read_string()?,
        },
        CommandKind::Message => Command::Message {
            positive: r.read_bool()?,
            text: r.read_string()?,
        },
        other => {
            return Err(SessionError::Protocol(format!(
                "command kind {other} has no payload decoder"
            )))
        }
    };
    Ok(cmd)
}

pub fn encode_response(resp: &Response) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u8(TAG_RESPONSE);
    w.write_bool(resp.yes);
    match &resp.error {
        Some(message) => {
            w.write_bool(true);
            w.write_string(message);
        }
        None => w.write_bool(false),
    }

    match &resp.body {
        ResponseBody::Simple => w.write_u8(0),
        ResponseBody::ClassId { class_id } => {
            w.write_u8(1);
            w.write_i32(*class_id);
        }
        ResponseBody::VmProperties(p) => {
            w.write_u8(2);
            w.write_i32(p.agent_version);
            w.write_i32(p.agent_id);
            w.write_string(&p.jdk_version);
            w.write_string(&p.jvm_arguments);
            w.write_string(&p.java_command);
            w.write_string(&p.target_os);
            w.write_string(&p.working_dir);
            w.write_string(&p.class_path);
            w.write_i64(p.max_heap_size);
            w.write_i64(p.startup_time_millis);
            w.write_i64(p.startup_time_counts);
        }
        ResponseBody::Calibration(c) => {
            w.write_u8(3);
            w.write_f64s(&c.method_entry_exit_call_time);
            w.write_f64s(&c.method_entry_exit_inner_time);
            w.write_f64s(&c.method_entry_exit_outer_time);
            w.write_i64s(&c.timer_counts_in_second);
        }
        ResponseBody::InternalStats(s) => {
            w.write_u8(4);
            w.write_i32(s.n_total_instr_methods);
            w.write_i32(s.n_class_loads);
            w.write_i32(s.n_first_method_invocations);
            w.write_i32(s.n_non_empty_instr_method_group_responses);
            w.write_i32(s.n_empty_instr_method_group_responses);
            w.write_i32(s.n_single_method_instr_method_group_responses);
            w.write_f64(s.client_instr_time);
            w.write_f64(s.client_data_proc_time);
            w.write_f64(s.total_hotswapping_time);
            w.write_f64(s.average_hotswapping_time);
            w.write_f64(s.min_hotswapping_time);
            w.write_f64(s.max_hotswapping_time);
        }
        ResponseBody::DumpResults { dump_abs_timestamp } => {
            w.write_u8(5);
            w.write_i64(*dump_abs_timestamp);
        }
        ResponseBody::MethodGroup(group) => {
            w.write_u8(6);
            write_method_group(&mut w, group);
        }
        ResponseBody::HeapHistogram(entries) => {
            w.write_u8(7);
            w.write_u32(entries.len() as u32);
            for e in entries {
                w.write_string(&e.class_name);
                w.write_i64(e.instances);
                w.write_i64(e.bytes);
            }
        }
        ResponseBody::ThreadLiveness(status) => {
            w.write_u8(8);
            w.write_bytes(status);
        }
        ResponseBody::ObjectAllocation(counts) => {
            w.write_u8(9);
            w.write_i32s(counts);
        }
        ResponseBody::CodeRegionCpu(results) => {
            w.write_u8(10);
            w.write_i64s(results);
        }
        ResponseBody::MethodNames(names) => {
            w.write_u8(11);
            w.write_u32(names.len() as u32);
            for n in names {
                w.write_string(&n.class_name);
                w.write_string(&n.method_name);
                w.write_string(&n.signature);
            }
        }
        ResponseBody::DefiningLoader { loader_id } => {
            w.write_u8(12);
            w.write_i32(*loader_id);
        }
        ResponseBody::MonitoredNumbers(m) => {
            w.write_u8(13);
            w.write_i64(m.free_memory);
            w.write_i64(m.total_memory);
            w.write_i32(m.user_threads);
            w.write_i32(m.system_threads);
            w.write_i32(m.surviving_generations);
            w.write_f64(m.relative_gc_time);
            w.write_i64(m.last_gc_pause_ms);
        }
    }

    w.into_vec()
}

fn decode_response(r: &mut WireReader<'_>) -> Result<Response> {
    let yes = r.read_bool()?;
    let error = if r.read_bool()? {
        Some(r.read_string()?)
    } else {
        None
    };

    let body = match r.read_u8()? {
        0 => ResponseBody::Simple,
        1 => ResponseBody::ClassId {
            class_id: r.read_i32()?,
        },
        2 => ResponseBody::VmProperties(VmProperties {
            agent_version: r.read_i32()?,
            agent_id: r.read_i32()?,
            jdk_version: r.read_string()?,
            jvm_arguments: r.read_string()?,
            java_command: r.read_string()?,
            target_os: r.read_string()?,
            working_dir: r.read_string()?,
            class_path: r.read_string()?,
            max_heap_size: r.read_i64()?,
            startup_time_millis: r.read_i64()?,
            startup_time_counts: r.read_i64()?,
        }),
        3 => ResponseBody::Calibration(CalibrationData {
            method_entry_exit_call_time: r.read_f64s()?,
            method_entry_exit_inner_time: r.read_f64s()?,
            method_entry_exit_outer_time: r.read_f64s()?,
            timer_counts_in_second: r.read_i64s()?,
        }),
        4 => ResponseBody::InternalStats(InternalStats {
            n_total_instr_methods: r.read_i32()?,
            n_class_loads: r.read_i32()?,
            n_first_method_invocations: r.read_i32()?,
            n_non_empty_instr_method_group_responses: r.read_i32()?,
            n_empty_instr_method_group_responses: r.read_i32()?,
            n_single_method_instr_method_group_responses: r.read_i32()?,
            client_instr_time: r.read_f64()?,
            client_data_proc_time: r.read_f64()?,
            total_hotswapping_time: r.read_f64()?,
            average_hotswapping_time: r.read_f64()?,
            min_hotswapping_time: r.read_f64()?,
            max_hotswapping_time: r.read_f64()?,
        }),
        5 => ResponseBody::DumpResults {
            dump_abs_timestamp: r.read_i64()?,
        },
        6 => ResponseBody::MethodGroup(read_method_group(r)?),
        7 => {
            let count = r.read_count(20)?;
            let entries = (0..count)
                .map(|_| {
                    Ok(HistogramEntry {
                        class_name: r.read_string()?,
                        instances: r.read_i64()?,
                        bytes: r.read_i64()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            ResponseBody::HeapHistogram(entries)
        }
        8 => ResponseBody::ThreadLiveness(r.read_bytes()?),
        9 => ResponseBody::ObjectAllocation(r.read_i32s()?),
        10 => ResponseBody::CodeRegionCpu(r.read_i64s()?),
        11 => {
            let count = r.read_count(12)?;
            let names = (0..count)
                .map(|_| {
                    Ok(MethodName {
                        class_name: r.read_string()?,
                        method_name: r.read_string()?,
                        signature: r.read_string()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            ResponseBody::MethodNames(names)
        }
        12 => ResponseBody::DefiningLoader {
            loader_id: r.read_i32()?,
        },
        13 => ResponseBody::MonitoredNumbers(MonitoredNumbers {
            free_memory: r.read_i64()?,
            total_memory: r.read_i64()?,
            user_threads: r.read_i32()?,
            system_threads: r.read_i32()?,
            surviving_generations: r.read_i32()?,
            relative_gc_time: r.read_f64()?,
            last_gc_pause_ms: r.read_i64()?,
        }),
        other => {
            return Err(SessionError::Protocol(format!(
                "unknown response body {other}"
            )))
        }
    };

    Ok(Response { yes, error, body })
}

pub fn decode_message(body: &[u8]) -> Result<Message> {
    let mut r = WireReader::new(body);
    let message = match r.read_u8()? {
        TAG_COMMAND => Message::Command(decode_command(&mut r)?),
        TAG_RESPONSE => Message::Response(decode_response(&mut r)?),
        tag => {
            return Err(SessionError::Protocol(format!(
                "unknown message tag {tag}"
            )))
        }
    };
    r.finish()?;
    Ok(message)
}

/// Instant of the last frame read from the target, shared with whoever
/// waits on responses.
#[derive(Clone)]
pub struct InboundClock(Arc<Mutex<Instant>>);

impl InboundClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.0.lock()
    }
}

impl Default for InboundClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Write half of the connection.
pub struct WireSender<W: Write> {
    out: W,
}

impl<W: Write> WireSender<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_frame(&mut self, body: &[u8]) -> io::Result<()> {
        if body.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large ({} bytes)", body.len()),
            ));
        }
        self.out.write_all(&(body.len() as u32).to_be_bytes())?;
        self.out.write_all(body)?;
        self.out.flush()
    }

    pub fn send_simple_command(&mut self, kind: CommandKind) -> io::Result<()> {
        debug_assert!(kind.is_simple(), "{kind} carries a payload");
        debug!(command = %kind, "sending simple command");
        self.write_frame(&[TAG_COMMAND, kind.code()])
    }

    pub fn send_complex_command(&mut self, cmd: &Command) -> io::Result<()> {
        debug!(command = %cmd.kind(), "sending command");
        self.write_frame(&encode_command(cmd))
    }

    pub fn send_simple_response(&mut self, yes: bool, error: Option<&str>) -> io::Result<()> {
        let resp = match error {
            Some(message) => Response {
                yes,
                error: Some(message.to_string()),
                body: ResponseBody::Simple,
            },
            None => Response::ok(yes),
        };
        self.send_complex_response(&resp)
    }

    pub fn send_complex_response(&mut self, resp: &Response) -> io::Result<()> {
        trace!(yes = resp.yes, ok = resp.is_ok(), "sending response");
        self.write_frame(&encode_response(resp))
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Read half of the connection. Only the listener thread owns one.
pub struct WireReceiver<R: Read> {
    input: R,
    clock: InboundClock,
}

impl<R: Read> WireReceiver<R> {
    pub fn new(input: R, clock: InboundClock) -> Self {
        Self { input, clock }
    }

    /// Fills `buf`, returning `false` if the stream ended before the first byte.
    fn read_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Decodes the next message; `None` means the peer closed the stream.
    pub fn receive_command_or_response(&mut self) -> Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        if !self.read_or_eof(&mut len_buf)? {
            return Ok(None);
        }

        let length = u32::from_be_bytes(len_buf) as usize;
        if length == 0 || length > MAX_FRAME_BYTES {
            return Err(SessionError::Protocol(format!(
                "invalid frame length {length}"
            )));
        }

        let mut body = vec![0u8; length];
        self.input.read_exact(&mut body)?;
        self.clock.touch();

        decode_message(&body).map(Some)
    }
}
