// Layered stream I/O runtime: stackable filters over arbitrary transports.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.


//! File transport: a leaf handle reading from one file and writing to another.
//!
//! Reads are performed from deferred context whenever read callbacks are enabled, up to the
//! configured buffer size at a time. Without an output file writes are discarded, and reported
//! as fully written.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read, Write};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::MutexGuard;

use crate::args::{check_keybool, check_keyds, check_keymode, check_keyvalue};
use crate::gensio::{CloseDone, Gensio, GensioEvent, GensioFunctions, OpenDone, WeakGensio};
use crate::os::{Lock, OsFuncs, Runner};
use crate::registry::Registry;
use crate::Error;

pub const DEFAULT_READ_BUF: usize = 1024;
pub const DEFAULT_MODE: u32 = 0o666;

/// Options of the file transport.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct FileConfig {
    /// Maximum number of bytes read and delivered at once.
    pub read_buf: usize,
    pub infile: Option<PathBuf>,
    pub outfile: Option<PathBuf>,
    /// Create the output file if it doesn't exist.
    pub create: bool,
    /// Permissions of a created output file.
    pub mode: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            read_buf: DEFAULT_READ_BUF,
            infile: None,
            outfile: None,
            create: false,
            mode: DEFAULT_MODE,
        }
    }
}

impl FileConfig {
    /// Parses `readbuf=<size>`, `infile=<path>`, `outfile=<path>`, `create[=<bool>]` and
    /// `umode=`/`gmode=`/`omode=<mode>` options.
    pub fn from_args(args: &[String]) -> Result<Self, Error> {
        let mut config = FileConfig::default();
        let (mut umode, mut gmode, mut omode) = (6, 6, 6);
        for arg in args {
            if let Some(size) = check_keyds(arg, "readbuf")? {
                config.read_buf = size;
            } else if let Some(path) = check_keyvalue(arg, "infile") {
                config.infile = Some(path.into());
            } else if let Some(path) = check_keyvalue(arg, "outfile") {
                config.outfile = Some(path.into());
            } else if let Some(create) = check_keybool(arg, "create")? {
                config.create = create;
            } else if let Some(mode) = check_keymode(arg, "umode")? {
                umode = mode;
            } else if let Some(mode) = check_keymode(arg, "gmode")? {
                gmode = mode;
            } else if let Some(mode) = check_keymode(arg, "omode")? {
                omode = mode;
            } else {
                #[cfg(feature = "log")]
                log::error!(target: "file", "Unknown file option '{arg}'");
                return Err(Error::Inval);
            }
        }
        if config.read_buf == 0 {
            return Err(Error::Inval);
        }
        config.mode = umode << 6 | gmode << 3 | omode;
        Ok(config)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
enum State {
    Closed,
    InOpen,
    Open,
    InOpenClose,
    InClose,
}

struct FileData {
    refcount: usize,
    state: State,
    inf: Option<File>,
    outf: Option<File>,
    read_buf: Vec<u8>,
    data_pending: usize,
    read_err: Option<Error>,
    read_enabled: bool,
    xmit_enabled: bool,
    open_done: Option<OpenDone>,
    close_done: Option<CloseDone>,
    deferred_op_pending: bool,
    in_deferred_op: bool,
    deferred_op_rerun: bool,
    hold: Option<Gensio>,
}

struct FileInner {
    io: WeakGensio,
    config: FileConfig,
    runner: Runner,
    data: Lock<FileData>,
}

struct FileGensio {
    inner: Arc<FileInner>,
}

/// Allocates a closed file handle.
pub fn file_gensio_alloc(
    os: &OsFuncs,
    config: FileConfig,
    event: Option<Arc<dyn GensioEvent>>,
) -> Gensio {
    let io = Gensio::new_cyclic(os, "file", None, event, |weak| {
        let inner = Arc::new_cyclic(|me: &Weak<FileInner>| {
            let runner = os.alloc_runner({
                let me = me.clone();
                move || {
                    if let Some(inner) = me.upgrade() {
                        inner.deferred_op()
                    }
                }
            });
            FileInner {
                io: weak,
                runner,
                data: Lock::new(FileData {
                    refcount: 1,
                    state: State::Closed,
                    inf: None,
                    outf: None,
                    read_buf: vec![0u8; config.read_buf],
                    data_pending: 0,
                    read_err: None,
                    read_enabled: false,
                    xmit_enabled: false,
                    open_done: None,
                    close_done: None,
                    deferred_op_pending: false,
                    in_deferred_op: false,
                    deferred_op_rerun: false,
                    hold: None,
                }),
                config,
            }
        });
        Box::new(FileGensio { inner })
    });
    io.set_is_client(true);
    io.set_is_reliable(true);
    io
}

/// Descriptor factory of the file transport. File handles have no nested descriptor.
pub fn str_to_file_gensio(
    registry: &Registry,
    rest: &str,
    args: &[String],
    event: Option<Arc<dyn GensioEvent>>,
) -> Result<Gensio, Error> {
    if !rest.is_empty() {
        return Err(Error::Inval);
    }
    let config = FileConfig::from_args(args)?;
    Ok(file_gensio_alloc(registry.os(), config, event))
}

impl FileInner {
    fn start_deferred_op(&self, st: &mut FileData) {
        if st.in_deferred_op {
            // The running op picks the change up before it returns
            st.deferred_op_rerun = true;
            return;
        }
        if st.deferred_op_pending {
            return;
        }
        let Some(io) = self.io.upgrade() else {
            return;
        };
        st.deferred_op_pending = true;
        st.refcount += 1;
        st.hold = Some(io);
        self.runner.schedule();
    }

    fn deref_and_unlock(&self, mut st: MutexGuard<FileData>) {
        assert!(st.refcount > 0, "file handle reference count underflow");
        st.refcount -= 1;
        if st.refcount > 0 {
            return;
        }

        #[cfg(feature = "log")]
        log::debug!(target: "file", "Finalizing file handle");

        st.state = State::Closed;
        st.inf = None;
        st.outf = None;
        let open_done = st.open_done.take();
        let close_done = st.close_done.take();
        drop(st);
        drop(open_done);
        drop(close_done);
    }

    fn fill_read_buf(st: &mut FileData) {
        let Some(inf) = st.inf.as_mut() else {
            return;
        };
        loop {
            match inf.read(&mut st.read_buf) {
                Ok(0) => st.read_err = Some(Error::RemClose),
                Ok(count) => st.data_pending = count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "file", "Error reading input file: {err}");
                    st.read_err = Some(err.into());
                }
            }
            break;
        }
    }

    fn deferred_op(&self) {
        let mut st = self.data.lock();
        st.deferred_op_pending = false;
        let Some(io) = st.hold.take() else {
            return self.deref_and_unlock(st);
        };
        st.in_deferred_op = true;

        let mut retry_read = false;
        loop {
            st.deferred_op_rerun = false;
            Self::deferred_step(&mut st, &io, &mut retry_read);
            if !st.deferred_op_rerun {
                break;
            }
        }
        st.in_deferred_op = false;
        if retry_read {
            // Try again from the next deferred op instead of spinning here
            self.start_deferred_op(&mut st);
        }

        self.deref_and_unlock(st);
    }

    fn deferred_step(st: &mut MutexGuard<FileData>, io: &Gensio, retry_read: &mut bool) {
        if matches!(st.state, State::InOpen | State::InOpenClose) {
            let res = if st.state == State::InOpenClose {
                st.state = State::InClose;
                Err(Error::LocalClosed)
            } else {
                st.state = State::Open;
                Ok(())
            };

            #[cfg(feature = "log")]
            log::trace!(target: "file", "Open completed with {res:?}");

            if let Some(done) = st.open_done.take() {
                MutexGuard::unlocked(st, || done(io, res));
            }
        }

        while !*retry_read
            && st.state == State::Open
            && st.read_enabled
            && (st.inf.is_some() || st.read_err.is_some())
        {
            if st.data_pending == 0 && st.read_err.is_none() {
                Self::fill_read_buf(st);
            }
            if st.data_pending == 0 {
                if let Some(err) = st.read_err.clone() {
                    // Errors are reported once per enable
                    st.read_enabled = false;
                    MutexGuard::unlocked(st, || io.deliver_read(Err(err)));
                }
                continue;
            }
            let buf = mem::take(&mut st.read_buf);
            let pending = st.data_pending;
            let consumed = MutexGuard::unlocked(st, || io.deliver_read(Ok(&buf[..pending])));
            st.read_buf = buf;
            if consumed == 0 {
                *retry_read = true;
                break;
            }
            if consumed >= st.data_pending {
                st.data_pending = 0;
            } else {
                let pending = st.data_pending;
                st.read_buf.copy_within(consumed..pending, 0);
                st.data_pending -= consumed;
            }
        }

        while st.state == State::Open && st.xmit_enabled {
            MutexGuard::unlocked(st, || io.deliver_write_ready());
        }

        if st.state == State::InClose {
            st.state = State::Closed;

            #[cfg(feature = "log")]
            log::trace!(target: "file", "Close completed");

            if let Some(done) = st.close_done.take() {
                MutexGuard::unlocked(st, || done(io));
            }
        }
    }

    fn open(&self, done: Option<OpenDone>) -> Result<(), Error> {
        let mut st = self.data.lock();
        if st.state != State::Closed {
            return Err(Error::NotReady);
        }
        let inf = self.config.infile.as_ref().map(File::open).transpose()?;
        let outf = self
            .config
            .outfile
            .as_ref()
            .map(|path| {
                OpenOptions::new()
                    .write(true)
                    .create(self.config.create)
                    .mode(self.config.mode)
                    .open(path)
            })
            .transpose()?;

        #[cfg(feature = "log")]
        log::debug!(target: "file", "Opened files {:?} and {:?}", self.config.infile, self.config.outfile);

        st.inf = inf;
        st.outf = outf;
        st.data_pending = 0;
        st.read_err = None;
        st.state = State::InOpen;
        st.open_done = done;
        self.start_deferred_op(&mut st);
        Ok(())
    }

    fn close(&self, done: Option<CloseDone>) -> Result<(), Error> {
        let mut st = self.data.lock();
        st.state = match st.state {
            State::InOpen => State::InOpenClose,
            State::Open => State::InClose,
            _ => return Err(Error::NotReady),
        };
        st.inf = None;
        st.outf = None;
        st.close_done = done;
        self.start_deferred_op(&mut st);
        Ok(())
    }

    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error> {
        let mut st = self.data.lock();
        if st.state != State::Open {
            return Err(Error::NotReady);
        }
        let total: usize = sg.iter().map(|buf| buf.len()).sum();
        let Some(outf) = st.outf.as_mut() else {
            return Ok(total);
        };
        if total == 0 {
            return Ok(0);
        }
        let slices = sg.iter().map(|buf| IoSlice::new(buf)).collect::<Vec<_>>();
        loop {
            match outf.write_vectored(&slices) {
                Ok(0) => return Err(Error::RemClose),
                Ok(count) => return Ok(count),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn set_read_callback_enable(&self, enabled: bool) {
        let mut st = self.data.lock();
        if st.read_enabled == enabled {
            return;
        }
        st.read_enabled = enabled;
        if enabled && st.state == State::Open && st.inf.is_some() {
            self.start_deferred_op(&mut st);
        }
    }

    fn set_write_callback_enable(&self, enabled: bool) {
        let mut st = self.data.lock();
        if st.xmit_enabled == enabled {
            return;
        }
        st.xmit_enabled = enabled;
        if enabled && st.state == State::Open {
            self.start_deferred_op(&mut st);
        }
    }
}

impl GensioFunctions for FileGensio {
    fn open(&self, done: Option<OpenDone>) -> Result<(), Error> { self.inner.open(done) }

    fn close(&self, done: Option<CloseDone>) -> Result<(), Error> { self.inner.close(done) }

    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error> { self.inner.write(sg) }

    fn set_read_callback_enable(&self, enabled: bool) { self.inner.set_read_callback_enable(enabled) }

    fn set_write_callback_enable(&self, enabled: bool) {
        self.inner.set_write_callback_enable(enabled)
    }

    fn acquire(&self) {
        let mut st = self.inner.data.lock();
        assert!(st.refcount > 0, "acquiring a finalized file handle");
        st.refcount += 1;
    }

    fn release(&self) {
        let mut st = self.inner.data.lock();
        if st.refcount == 1 {
            st.state = State::Closed;
        }
        self.inner.deref_and_unlock(st);
    }

    fn remote_addr_string(&self) -> Result<String, Error> {
        let config = &self.inner.config;
        let mut addr = vec![];
        if let Some(path) = &config.infile {
            addr.push(format!("infile={}", path.display()));
        }
        if let Some(path) = &config.outfile {
            addr.push(format!("outfile={}", path.display()));
        }
        Ok(format!("file({})", addr.join(",")))
    }

    fn disable(&self) -> Result<(), Error> {
        let mut st = self.inner.data.lock();
        st.state = State::Closed;
        st.inf = None;
        st.outf = None;
        Ok(())
    }
}
