//! `windows-sys` binding of [`EtwApi`]

#![allow(unsafe_code)] // Win32 ETW and token APIs

use std::cell::Cell;
use std::ffi::c_void;
use std::mem::{size_of, zeroed};
use std::ptr;
use std::slice;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_SUCCESS, HANDLE, LUID};
use windows_sys::Win32::Security::{
    AdjustTokenPrivileges, LookupPrivilegeValueA, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES,
};
use windows_sys::Win32::System::Diagnostics::Etw::{
    CloseTrace, ControlTraceA, OpenTraceA, ProcessTrace, StartTraceA, SystemTraceControlGuid,
    CONTROLTRACE_HANDLE, EVENT_RECORD, EVENT_TRACE_CONTROL_STOP, EVENT_TRACE_FLAG_CSWITCH,
    EVENT_TRACE_FLAG_DISPATCHER, EVENT_TRACE_LOGFILEA, EVENT_TRACE_PROPERTIES,
    EVENT_TRACE_REAL_TIME_MODE, PROCESSTRACE_HANDLE, PROCESS_TRACE_MODE_EVENT_RECORD,
    PROCESS_TRACE_MODE_RAW_TIMESTAMP, PROCESS_TRACE_MODE_REAL_TIME, WNODE_FLAG_TRACED_GUID,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use super::{ConsumerHandle, EtwApi, EtwRecord, SessionHandle};

const KERNEL_LOGGER_NAME: &[u8] = b"NT Kernel Logger\0";
const INVALID_PROCESSTRACE_HANDLE: u64 = u64::MAX;

/// `Wnode.ClientContext` values selecting the timestamp source
const CLOCK_QPC: u32 = 1;
const CLOCK_CPU_CYCLE: u32 = 3;

type RecordCallback<'a> = &'a mut dyn FnMut(&EtwRecord<'_>);

thread_local! {
    /// Callback of the `ProcessTrace` call running on this thread
    static DISPATCH: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

/// `EVENT_TRACE_PROPERTIES` followed by the logger name it points at
#[repr(C)]
struct SessionProperties {
    props: EVENT_TRACE_PROPERTIES,
    name: [u8; 32],
}

/// Kernel logger driven through `windows-sys`
pub struct Win32Etw {
    cycle_counter: bool,
}

impl Win32Etw {
    /// `cycle_counter` selects raw CPU cycle timestamps instead of QPC.
    #[must_use]
    pub fn new(cycle_counter: bool) -> Self {
        Self { cycle_counter }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn properties(&self) -> SessionProperties {
        // SAFETY: all-zero is a valid EVENT_TRACE_PROPERTIES.
        let mut p: SessionProperties = unsafe { zeroed() };
        p.props.Wnode.BufferSize = size_of::<SessionProperties>() as u32;
        p.props.Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        p.props.Wnode.ClientContext = if self.cycle_counter { CLOCK_CPU_CYCLE } else { CLOCK_QPC };
        p.props.Wnode.Guid = SystemTraceControlGuid;
        p.props.EnableFlags = EVENT_TRACE_FLAG_CSWITCH | EVENT_TRACE_FLAG_DISPATCHER;
        p.props.LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
        p.props.LoggerNameOffset = size_of::<EVENT_TRACE_PROPERTIES>() as u32;
        p.name[..KERNEL_LOGGER_NAME.len()].copy_from_slice(KERNEL_LOGGER_NAME);
        p
    }

    fn control_stop(&self, session: u64, name: *const u8) -> u32 {
        let mut props = self.properties();
        // SAFETY: props is a correctly sized properties block that outlives the call.
        unsafe {
            ControlTraceA(CONTROLTRACE_HANDLE { Value: session }, name, &mut props.props, EVENT_TRACE_CONTROL_STOP)
        }
    }
}

impl EtwApi for Win32Etw {
    fn enable_profile_privilege(&self) -> Result<(), u32> {
        let mut privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: LUID { LowPart: 0, HighPart: 0 },
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        // SAFETY: every pointer refers to a live local; the token handle is closed below.
        unsafe {
            let name = b"SeSystemProfilePrivilege\0";
            if LookupPrivilegeValueA(ptr::null(), name.as_ptr(), &mut privileges.Privileges[0].Luid) == 0 {
                return Err(GetLastError());
            }
            let mut token: HANDLE = ptr::null_mut();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES, &mut token) == 0 {
                return Err(GetLastError());
            }
            let adjusted = AdjustTokenPrivileges(token, 0, &privileges, 0, ptr::null_mut(), ptr::null_mut());
            // ERROR_NOT_ALL_ASSIGNED is reported through the last error even on success.
            let status = GetLastError();
            CloseHandle(token);
            if adjusted == 0 || status != ERROR_SUCCESS {
                return Err(status);
            }
        }
        Ok(())
    }

    fn stop_stale_session(&self) -> u32 {
        self.control_stop(0, KERNEL_LOGGER_NAME.as_ptr())
    }

    fn start_session(&self) -> Result<SessionHandle, u32> {
        let mut props = self.properties();
        let mut handle = CONTROLTRACE_HANDLE { Value: 0 };
        // SAFETY: handle and props are live locals; the name is NUL-terminated.
        let status = unsafe { StartTraceA(&mut handle, KERNEL_LOGGER_NAME.as_ptr(), &mut props.props) };
        if status == ERROR_SUCCESS {
            Ok(SessionHandle(handle.Value))
        } else {
            Err(status)
        }
    }

    fn open_consumer(&self) -> Result<ConsumerHandle, u32> {
        let mut name = [0u8; 32];
        name[..KERNEL_LOGGER_NAME.len()].copy_from_slice(KERNEL_LOGGER_NAME);
        // SAFETY: all-zero is a valid EVENT_TRACE_LOGFILEA; the name outlives OpenTraceA.
        unsafe {
            let mut logfile: EVENT_TRACE_LOGFILEA = zeroed();
            logfile.LoggerName = name.as_mut_ptr();
            logfile.Anonymous1.ProcessTraceMode = PROCESS_TRACE_MODE_REAL_TIME
                | PROCESS_TRACE_MODE_EVENT_RECORD
                | PROCESS_TRACE_MODE_RAW_TIMESTAMP;
            logfile.Anonymous2.EventRecordCallback = Some(on_event_record);
            let handle = OpenTraceA(&mut logfile);
            if handle.Value == INVALID_PROCESSTRACE_HANDLE {
                return Err(GetLastError());
            }
            Ok(ConsumerHandle(handle.Value))
        }
    }

    fn process(&self, consumer: ConsumerHandle, on_record: &mut dyn FnMut(&EtwRecord<'_>)) -> Result<(), u32> {
        let mut callback: RecordCallback<'_> = on_record;
        DISPATCH.with(|slot| slot.set(ptr::from_mut(&mut callback).cast::<c_void>()));
        let handle = PROCESSTRACE_HANDLE { Value: consumer.0 };
        // SAFETY: ProcessTrace invokes on_event_record on this thread only while
        // `callback` is alive; the slot is cleared before it goes out of scope.
        let status = unsafe { ProcessTrace(&handle, 1, ptr::null(), ptr::null()) };
        DISPATCH.with(|slot| slot.set(ptr::null_mut()));
        if status == ERROR_SUCCESS {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn close_consumer(&self, consumer: ConsumerHandle) {
        // SAFETY: the handle came from OpenTraceA and is closed once by the collector.
        unsafe { CloseTrace(PROCESSTRACE_HANDLE { Value: consumer.0 }) };
    }

    fn stop_session(&self, session: SessionHandle) {
        self.control_stop(session.0, ptr::null());
    }
}

unsafe extern "system" fn on_event_record(record: *mut EVENT_RECORD) {
    let target = DISPATCH.with(Cell::get);
    // SAFETY: ETW passes a valid record for the duration of the callback.
    let Some(record) = (unsafe { record.as_ref() }) else { return };
    if target.is_null() {
        return;
    }
    let user_data: &[u8] = if record.UserData.is_null() {
        &[]
    } else {
        // SAFETY: UserData points at UserDataLength readable bytes.
        unsafe { slice::from_raw_parts(record.UserData.cast::<u8>(), usize::from(record.UserDataLength)) }
    };
    let decoded = EtwRecord {
        opcode: record.EventHeader.EventDescriptor.Opcode,
        timestamp: record.EventHeader.TimeStamp,
        // SAFETY: both union views of the buffer context start with the processor byte.
        processor: unsafe { record.BufferContext.Anonymous.Anonymous.ProcessorNumber },
        user_data,
    };
    // SAFETY: target was set by `process` on this thread and points at a live callback.
    let callback = unsafe { &mut *target.cast::<RecordCallback<'_>>() };
    callback(&decoded);
}
