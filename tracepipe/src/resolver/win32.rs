//! Thread and process queries for the Windows resolver

#![allow(unsafe_code)] // Win32 thread, process and module APIs

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use windows_sys::Wdk::System::Threading::{NtQueryInformationThread, THREADINFOCLASS};
use windows_sys::Win32::Foundation::{CloseHandle, LocalFree, HANDLE, HMODULE};
use windows_sys::Win32::System::ProcessStatus::{
    EnumProcessModules, GetModuleBaseNameA, GetModuleInformation, GetProcessImageFileNameA, MODULEINFO,
};
use windows_sys::Win32::System::Threading::{
    GetProcessIdOfThread, GetThreadDescription, OpenProcess, OpenThread, PROCESS_QUERY_INFORMATION,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ, THREAD_QUERY_INFORMATION,
    THREAD_QUERY_LIMITED_INFORMATION,
};

use crate::domain::{Pid, Tid};

use super::NameSource;

const THREAD_QUERY_SET_WIN32_START_ADDRESS: THREADINFOCLASS = 9;
const MAX_MODULES: usize = 1024;

/// Closes the wrapped handle on drop
struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn new(handle: HANDLE) -> Option<Self> {
        (!handle.is_null()).then_some(Self(handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by an Open* call and is closed once.
        unsafe { CloseHandle(self.0) };
    }
}

fn open_thread(access: u32, tid: Tid) -> Option<OwnedHandle> {
    // SAFETY: OpenThread has no pointer arguments.
    OwnedHandle::new(unsafe { OpenThread(access, 0, tid.0) })
}

fn open_process(access: u32, pid: Pid) -> Option<OwnedHandle> {
    // SAFETY: OpenProcess has no pointer arguments.
    OwnedHandle::new(unsafe { OpenProcess(access, 0, pid.0) })
}

fn ansi_to_string(buf: &[u8], len: u32) -> Option<String> {
    let len = usize::try_from(len).ok()?.min(buf.len());
    (len > 0).then(|| String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// [`NameSource`] using the Win32 thread and process APIs
#[derive(Debug, Clone, Copy, Default)]
pub struct Win32NameSource;

impl NameSource for Win32NameSource {
    fn system_process(&self) -> (Pid, &'static str) {
        (Pid(4), "System")
    }

    fn owning_process(&self, tid: Tid) -> Option<Pid> {
        let thread = open_thread(THREAD_QUERY_LIMITED_INFORMATION, tid)?;
        // SAFETY: thread is a live handle with query access.
        let pid = unsafe { GetProcessIdOfThread(thread.0) };
        (pid != 0).then_some(Pid(pid))
    }

    /// Thread description set with `SetThreadDescription`.
    fn thread_name(&self, tid: Tid) -> Option<String> {
        let thread = open_thread(THREAD_QUERY_LIMITED_INFORMATION, tid)?;
        let mut description: *mut u16 = ptr::null_mut();
        // SAFETY: description is a live out-pointer; the returned buffer is freed below.
        let hr = unsafe { GetThreadDescription(thread.0, &mut description) };
        if hr < 0 || description.is_null() {
            return None;
        }
        // SAFETY: GetThreadDescription returns a NUL-terminated wide string.
        let name = unsafe {
            let len = (0..).take_while(|&i| *description.add(i) != 0).count();
            String::from_utf16_lossy(std::slice::from_raw_parts(description, len))
        };
        // SAFETY: the buffer was allocated by GetThreadDescription with LocalAlloc.
        unsafe { LocalFree(description.cast::<c_void>()) };
        Some(name)
    }

    /// Base name of the module containing the thread's start address.
    #[allow(clippy::cast_possible_truncation)]
    fn thread_name_fallback(&self, tid: Tid, pid: Option<Pid>) -> Option<String> {
        let pid = pid?;
        let thread = open_thread(THREAD_QUERY_INFORMATION, tid)?;
        let mut start: usize = 0;
        // SAFETY: start is a live pointer-sized out-buffer.
        let status = unsafe {
            NtQueryInformationThread(
                thread.0,
                THREAD_QUERY_SET_WIN32_START_ADDRESS,
                ptr::from_mut(&mut start).cast::<c_void>(),
                size_of::<usize>() as u32,
                ptr::null_mut(),
            )
        };
        if status < 0 {
            return None;
        }

        let process = open_process(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, pid)?;
        let mut modules: Vec<HMODULE> = vec![ptr::null_mut(); MAX_MODULES];
        let mut needed = 0u32;
        // SAFETY: modules holds MAX_MODULES handles, matching the byte count passed.
        let ok = unsafe {
            EnumProcessModules(
                process.0,
                modules.as_mut_ptr(),
                (modules.len() * size_of::<HMODULE>()) as u32,
                &mut needed,
            )
        };
        if ok == 0 {
            return None;
        }
        let count = (needed as usize / size_of::<HMODULE>()).min(MAX_MODULES);

        modules[..count].iter().find_map(|&module| {
            let mut info = MODULEINFO { lpBaseOfDll: ptr::null_mut(), SizeOfImage: 0, EntryPoint: ptr::null_mut() };
            // SAFETY: info is a live MODULEINFO of the size passed.
            let ok = unsafe {
                GetModuleInformation(process.0, module, &mut info, size_of::<MODULEINFO>() as u32)
            };
            let base = info.lpBaseOfDll as usize;
            if ok == 0 || start < base || start >= base + info.SizeOfImage as usize {
                return None;
            }
            let mut buf = [0u8; 1024];
            // SAFETY: buf is a live buffer of the length passed.
            let len = unsafe { GetModuleBaseNameA(process.0, module, buf.as_mut_ptr(), buf.len() as u32) };
            ansi_to_string(&buf, len)
        })
    }

    /// NT device path of the process image.
    #[allow(clippy::cast_possible_truncation)]
    fn process_image(&self, pid: Pid) -> Option<String> {
        let process = open_process(PROCESS_QUERY_LIMITED_INFORMATION, pid)?;
        let mut buf = [0u8; 1024];
        // SAFETY: buf is a live buffer of the length passed.
        let len = unsafe { GetProcessImageFileNameA(process.0, buf.as_mut_ptr(), buf.len() as u32) };
        ansi_to_string(&buf, len)
    }
}
