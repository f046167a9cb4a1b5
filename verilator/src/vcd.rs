// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use std::{ffi, fmt, sync::Arc};

use simharness_core::TraceSink;

use crate::ModelLibrary;

#[derive(Clone, Copy)]
pub(crate) struct VcdApi {
    pub(crate) dump: extern "C" fn(*mut ffi::c_void, u64),
    pub(crate) flush: extern "C" fn(*mut ffi::c_void),
    pub(crate) close_and_delete: extern "C" fn(*mut ffi::c_void),
}

/// A VCD dump opened by [`crate::VerilatedTop::open_vcd`].
pub struct Vcd {
    handle: *mut ffi::c_void,
    api: VcdApi,
    /// Keeps the code behind `api` loaded.
    library: Arc<ModelLibrary>,
}

impl Vcd {
    pub(crate) fn new(
        handle: *mut ffi::c_void,
        library: Arc<ModelLibrary>,
    ) -> Self {
        Self {
            handle,
            api: library.vcd_api,
            library,
        }
    }

    /// The VCD is automatically closed when dropped, but it may be useful to
    /// call this manually.
    pub fn close(self) {
        drop(self);
    }
}

impl TraceSink for Vcd {
    /// Documentation taken from the Verilator header file:
    ///
    /// > Write one cycle of dump data
    /// > Call with the current context's time just after eval'ed,
    /// > e.g. `->dump(contextp->time())`.
    fn dump(&mut self, timestamp: u64) {
        (self.api.dump)(self.handle, timestamp);
    }

    /// Documentation taken from the Verilator header file:
    ///
    /// > Flush dump
    fn flush(&mut self) {
        (self.api.flush)(self.handle);
    }
}

impl Drop for Vcd {
    fn drop(&mut self) {
        (self.api.close_and_delete)(self.handle);
        self.handle = std::ptr::null_mut();
    }
}

impl fmt::Debug for Vcd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcd")
            .field("handle", &self.handle)
            .field("top", &self.library.top())
            .finish()
    }
}
