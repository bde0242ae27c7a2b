//! In-process stand-in for librados.
//!
//! `SimRados` keeps objects in memory and completes asynchronous operations
//! on its own named worker threads, calling the completion trampolines the
//! same way librados does: with the native completion pointer and the opaque
//! callback context. Like librados, a released completion stays alive until
//! the operation that references it has finished.
//!
//! With [`Delivery::Manual`] operations are applied at submission and the
//! notifications are held until [`SimRados::deliver`] fires them, which makes
//! callback ordering fully controllable.

use std::collections::HashMap;
use std::ffi::{CStr, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::handle::CallbackContext;
use crate::handler::Channel;
use crate::native::{NativeAio, NativeCompletion, NativeIoCtx, ObjectStat, Trampoline};

/// Order in which the two notifications of an operation are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Delivery {
    #[default]
    AckThenDurable,
    DurableThenAck,
    /// Pick an order per operation.
    Random,
    /// Hold notifications until [`SimRados::deliver`].
    Manual,
}

/// Simulated backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Worker threads completing operations. 0 is treated as 1.
    pub workers: usize,
    pub delivery: Delivery,
    /// Pools that exist from the start.
    pub pools: Vec<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            delivery: Delivery::default(),
            pools: vec!["data".to_string()],
        }
    }
}

struct SimObject {
    data: Vec<u8>,
    mtime: i64,
}

struct SimPool {
    name: String,
    objects: Mutex<HashMap<String, SimObject>>,
}

#[derive(Default)]
struct OpState {
    complete: bool,
    safe: bool,
    rval: i32,
}

struct SimCompletion {
    context: CallbackContext,
    on_complete: Option<Trampoline>,
    on_safe: Option<Trampoline>,
    state: Mutex<OpState>,
    cond: Condvar,
}

impl SimCompletion {
    /// Borrow the completion behind a native handle.
    ///
    /// # Safety
    ///
    /// `native` must come from [`SimRados::create_completion`] and must not
    /// have been released.
    unsafe fn borrow<'a>(native: NativeCompletion) -> &'a SimCompletion {
        unsafe { &*(native.as_ptr() as *const SimCompletion) }
    }

    /// Take an extra reference for an in-flight operation.
    ///
    /// # Safety
    ///
    /// Same as [`borrow`](Self::borrow).
    unsafe fn retain(native: NativeCompletion) -> Arc<SimCompletion> {
        let ptr = native.as_ptr() as *const SimCompletion;
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    fn set_result(&self, rval: i32) {
        self.state.lock().rval = rval;
    }

    /// Run the trampoline for `channel`, then publish the flag so waiters
    /// return only after the callback has finished.
    fn deliver(self: &Arc<Self>, channel: Channel) {
        let trampoline = match channel {
            Channel::Acknowledged => self.on_complete,
            Channel::Durable => self.on_safe,
        };
        if let Some(trampoline) = trampoline {
            let native = Arc::as_ptr(self) as *mut c_void;
            // SAFETY: trampolines only decode the context and never unwind.
            unsafe { trampoline(native, self.context.into_ptr()) };
        }

        let mut state = self.state.lock();
        match channel {
            Channel::Acknowledged => state.complete = true,
            Channel::Durable => state.safe = true,
        }
        self.cond.notify_all();
    }

    fn wait(&self, channel: Channel) {
        let mut state = self.state.lock();
        loop {
            let done = match channel {
                Channel::Acknowledged => state.complete,
                Channel::Durable => state.safe,
            };
            if done {
                return;
            }
            self.cond.wait(&mut state);
        }
    }
}

enum Op {
    Write { data: Vec<u8>, offset: u64 },
    WriteFull { data: Vec<u8> },
    Append { data: Vec<u8> },
    Remove,
}

struct Job {
    pool: Arc<SimPool>,
    oid: String,
    op: Op,
    completion: Arc<SimCompletion>,
}

/// Largest object the simulator stores (the OSD default, 128 MiB).
pub const MAX_OBJECT_SIZE: usize = 128 << 20;

impl Job {
    /// Apply the operation and return its result. A panic while applying
    /// still yields a result so the completion is always delivered.
    fn run(&self) -> i32 {
        match panic::catch_unwind(AssertUnwindSafe(|| self.apply())) {
            Ok(rval) => rval,
            Err(_) => {
                warn!(oid = %self.oid, pool = %self.pool.name, "sim operation panicked");
                -libc::EIO
            }
        }
    }

    fn apply(&self) -> i32 {
        let mut objects = self.pool.objects.lock();
        let now = now_secs();
        match &self.op {
            Op::Write { data, offset } => {
                let Ok(start) = usize::try_from(*offset) else {
                    return -libc::EFBIG;
                };
                let Some(end) = start.checked_add(data.len()) else {
                    return -libc::EFBIG;
                };
                if end > MAX_OBJECT_SIZE {
                    return -libc::EFBIG;
                }
                let object = objects.entry(self.oid.clone()).or_insert(SimObject {
                    data: Vec::new(),
                    mtime: now,
                });
                if object.data.len() < end {
                    object.data.resize(end, 0);
                }
                object.data[start..end].copy_from_slice(data);
                object.mtime = now;
                0
            }
            Op::WriteFull { data } => {
                if data.len() > MAX_OBJECT_SIZE {
                    return -libc::EFBIG;
                }
                objects.insert(
                    self.oid.clone(),
                    SimObject {
                        data: data.clone(),
                        mtime: now,
                    },
                );
                0
            }
            Op::Append { data } => {
                let current = objects.get(&self.oid).map_or(0, |o| o.data.len());
                if current + data.len() > MAX_OBJECT_SIZE {
                    return -libc::EFBIG;
                }
                let object = objects.entry(self.oid.clone()).or_insert(SimObject {
                    data: Vec::new(),
                    mtime: now,
                });
                object.data.extend_from_slice(data);
                object.mtime = now;
                0
            }
            Op::Remove => match objects.remove(&self.oid) {
                Some(_) => 0,
                None => -libc::ENOENT,
            },
        }
    }
}

struct Held {
    completion: Arc<SimCompletion>,
    acknowledged: bool,
    durable: bool,
}

struct Shared {
    delivery: Delivery,
    connected: AtomicBool,
    conf: Mutex<HashMap<String, String>>,
    pools: Mutex<HashMap<String, Arc<SimPool>>>,
    fail_next_completion: AtomicI32,
    held: Mutex<Vec<Held>>,
}

/// Simulated native library. One instance is one cluster session.
pub struct SimRados {
    shared: Arc<Shared>,
    jobs: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SimRados {
    pub fn new(config: SimConfig) -> Self {
        let pools = config
            .pools
            .iter()
            .map(|name| {
                let pool = Arc::new(SimPool {
                    name: name.clone(),
                    objects: Mutex::new(HashMap::new()),
                });
                (name.clone(), pool)
            })
            .collect();

        let shared = Arc::new(Shared {
            delivery: config.delivery,
            connected: AtomicBool::new(false),
            conf: Mutex::new(HashMap::new()),
            pools: Mutex::new(pools),
            fail_next_completion: AtomicI32::new(0),
            held: Mutex::new(Vec::new()),
        });

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..config.workers.max(1))
            .filter_map(|id| {
                let rx = rx.clone();
                let delivery = config.delivery;
                let spawned = thread::Builder::new()
                    .name(format!("sim-osd-{id}"))
                    .spawn(move || run_worker(id, rx, delivery));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(worker_id = id, error = %e, "failed to spawn sim worker");
                        None
                    }
                }
            })
            .collect();

        Self {
            shared,
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Make the next `create_completion` fail with `code` (negative errno).
    pub fn fail_next_completion(&self, code: i32) {
        self.shared
            .fail_next_completion
            .store(code, Ordering::Release);
    }

    /// Create an empty pool. Returns `false` if it already exists.
    pub fn create_pool(&self, name: &str) -> bool {
        let mut pools = self.shared.pools.lock();
        if pools.contains_key(name) {
            return false;
        }
        pools.insert(
            name.to_string(),
            Arc::new(SimPool {
                name: name.to_string(),
                objects: Mutex::new(HashMap::new()),
            }),
        );
        true
    }

    /// Value most recently set for a configuration option.
    pub fn conf_get(&self, option: &str) -> Option<String> {
        self.shared.conf.lock().get(option).cloned()
    }

    /// Whether [`shutdown`](NativeAio::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.jobs.lock().is_none()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Operations whose notifications are still held (manual delivery).
    pub fn pending(&self) -> usize {
        self.shared.held.lock().len()
    }

    /// Fire `channel` for every held operation that has not received it yet,
    /// on the calling thread. Returns how many notifications were delivered.
    pub fn deliver(&self, channel: Channel) -> usize {
        let due: Vec<Arc<SimCompletion>> = {
            let mut held = self.shared.held.lock();
            held.iter_mut()
                .filter_map(|h| {
                    let flag = match channel {
                        Channel::Acknowledged => &mut h.acknowledged,
                        Channel::Durable => &mut h.durable,
                    };
                    if *flag {
                        None
                    } else {
                        *flag = true;
                        Some(h.completion.clone())
                    }
                })
                .collect()
        };

        // Trampolines run without the held lock so handlers may submit more.
        for completion in &due {
            completion.deliver(channel);
        }

        self.shared
            .held
            .lock()
            .retain(|h| !(h.acknowledged && h.durable));
        due.len()
    }

    fn pool_of<'a>(ioctx: NativeIoCtx) -> &'a SimPool {
        // SAFETY: io contexts handed out by `ioctx_create` stay valid until
        // `ioctx_destroy`, which the owning IoCtx calls last.
        unsafe { &*(ioctx.as_ptr() as *const SimPool) }
    }

    fn retain_pool(ioctx: NativeIoCtx) -> Arc<SimPool> {
        let ptr = ioctx.as_ptr() as *const SimPool;
        // SAFETY: see `pool_of`.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    fn submit(&self, ioctx: NativeIoCtx, oid: &CStr, completion: NativeCompletion, op: Op) -> i32 {
        let Ok(oid) = oid.to_str() else {
            return -libc::EINVAL;
        };
        let job = Job {
            pool: Self::retain_pool(ioctx),
            oid: oid.to_string(),
            op,
            // SAFETY: the caller holds the completion against release while
            // submitting.
            completion: unsafe { SimCompletion::retain(completion) },
        };

        if self.shared.delivery == Delivery::Manual {
            job.completion.set_result(job.run());
            self.shared.held.lock().push(Held {
                completion: job.completion,
                acknowledged: false,
                durable: false,
            });
            return 0;
        }

        match self.jobs.lock().as_ref() {
            Some(tx) if tx.send(job).is_ok() => 0,
            _ => -libc::ESHUTDOWN,
        }
    }
}

fn run_worker(id: usize, rx: crossbeam_channel::Receiver<Job>, delivery: Delivery) {
    debug!(worker_id = id, "sim worker started");
    for job in rx.iter() {
        let rval = job.run();
        job.completion.set_result(rval);

        let durable_first = match delivery {
            Delivery::DurableThenAck => true,
            Delivery::Random => rand::rng().random_bool(0.5),
            Delivery::AckThenDurable | Delivery::Manual => false,
        };
        let order = if durable_first {
            [Channel::Durable, Channel::Acknowledged]
        } else {
            [Channel::Acknowledged, Channel::Durable]
        };
        for channel in order {
            job.completion.deliver(channel);
        }
    }
    debug!(worker_id = id, "sim worker stopped");
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse `key = value` lines of a ceph.conf-style file, ignoring sections
/// and comments.
fn parse_conf(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(['#', ';', '[']))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

impl NativeAio for SimRados {
    fn conf_set(&self, option: &CStr, value: &CStr) -> i32 {
        let (Ok(option), Ok(value)) = (option.to_str(), value.to_str()) else {
            return -libc::EINVAL;
        };
        if option.is_empty() {
            return -libc::EINVAL;
        }
        self.shared
            .conf
            .lock()
            .insert(option.to_string(), value.to_string());
        0
    }

    fn conf_read_file(&self, path: &Path) -> i32 {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => return -e.raw_os_error().unwrap_or(libc::EIO),
        };
        let mut conf = self.shared.conf.lock();
        for (key, value) in parse_conf(&content) {
            conf.insert(key, value);
        }
        0
    }

    fn connect(&self) -> i32 {
        if self.shared.connected.swap(true, Ordering::AcqRel) {
            -libc::EISCONN
        } else {
            0
        }
    }

    fn shutdown(&self) {
        self.shared.connected.store(false, Ordering::Release);
        // Closing the channel lets workers drain queued jobs and exit.
        drop(self.jobs.lock().take());

        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("sim worker panicked");
            }
        }
    }

    fn ioctx_create(&self, pool: &CStr) -> Result<NativeIoCtx, i32> {
        if !self.is_connected() {
            return Err(-libc::ENOTCONN);
        }
        let name = pool.to_str().map_err(|_| -libc::EINVAL)?;
        let pool = self
            .shared
            .pools
            .lock()
            .get(name)
            .cloned()
            .ok_or(-libc::ENOENT)?;
        debug!(pool = %pool.name, "sim ioctx created");
        NativeIoCtx::from_ptr(Arc::into_raw(pool) as *mut c_void).ok_or(-libc::ENOMEM)
    }

    fn ioctx_destroy(&self, ioctx: NativeIoCtx) {
        // SAFETY: pairs with the `Arc::into_raw` in `ioctx_create`.
        drop(unsafe { Arc::from_raw(ioctx.as_ptr() as *const SimPool) });
    }

    fn create_completion(
        &self,
        context: CallbackContext,
        on_complete: Option<Trampoline>,
        on_safe: Option<Trampoline>,
    ) -> Result<NativeCompletion, i32> {
        let injected = self.shared.fail_next_completion.swap(0, Ordering::AcqRel);
        if injected != 0 {
            return Err(injected);
        }

        let completion = Arc::new(SimCompletion {
            context,
            on_complete,
            on_safe,
            state: Mutex::new(OpState::default()),
            cond: Condvar::new(),
        });
        NativeCompletion::from_ptr(Arc::into_raw(completion) as *mut c_void).ok_or(-libc::ENOMEM)
    }

    fn wait_for_complete(&self, completion: NativeCompletion) -> i32 {
        // SAFETY: callers hold the completion against release while waiting.
        unsafe { SimCompletion::borrow(completion) }.wait(Channel::Acknowledged);
        0
    }

    fn wait_for_safe(&self, completion: NativeCompletion) -> i32 {
        // SAFETY: as above.
        unsafe { SimCompletion::borrow(completion) }.wait(Channel::Durable);
        0
    }

    fn is_complete(&self, completion: NativeCompletion) -> bool {
        // SAFETY: as above.
        unsafe { SimCompletion::borrow(completion) }.state.lock().complete
    }

    fn is_safe(&self, completion: NativeCompletion) -> bool {
        // SAFETY: as above.
        unsafe { SimCompletion::borrow(completion) }.state.lock().safe
    }

    fn get_return_value(&self, completion: NativeCompletion) -> i32 {
        // SAFETY: as above.
        unsafe { SimCompletion::borrow(completion) }.state.lock().rval
    }

    fn release_completion(&self, completion: NativeCompletion) {
        // SAFETY: pairs with the `Arc::into_raw` in `create_completion`.
        // In-flight jobs hold their own reference.
        drop(unsafe { Arc::from_raw(completion.as_ptr() as *const SimCompletion) });
    }

    fn aio_write(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
        offset: u64,
    ) -> i32 {
        let op = Op::Write {
            data: data.to_vec(),
            offset,
        };
        self.submit(ioctx, oid, completion, op)
    }

    fn aio_write_full(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
    ) -> i32 {
        let op = Op::WriteFull {
            data: data.to_vec(),
        };
        self.submit(ioctx, oid, completion, op)
    }

    fn aio_append(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
    ) -> i32 {
        let op = Op::Append {
            data: data.to_vec(),
        };
        self.submit(ioctx, oid, completion, op)
    }

    fn aio_remove(&self, ioctx: NativeIoCtx, oid: &CStr, completion: NativeCompletion) -> i32 {
        self.submit(ioctx, oid, completion, Op::Remove)
    }

    fn read(&self, ioctx: NativeIoCtx, oid: &CStr, buf: &mut [u8], offset: u64) -> i32 {
        let Ok(oid) = oid.to_str() else {
            return -libc::EINVAL;
        };
        let objects = Self::pool_of(ioctx).objects.lock();
        let Some(object) = objects.get(oid) else {
            return -libc::ENOENT;
        };
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(object.data.len());
        let n = (object.data.len() - start).min(buf.len()).min(i32::MAX as usize);
        buf[..n].copy_from_slice(&object.data[start..start + n]);
        n as i32
    }

    fn stat(&self, ioctx: NativeIoCtx, oid: &CStr) -> Result<ObjectStat, i32> {
        let oid = oid.to_str().map_err(|_| -libc::EINVAL)?;
        let objects = Self::pool_of(ioctx).objects.lock();
        let object = objects.get(oid).ok_or(-libc::ENOENT)?;
        Ok(ObjectStat {
            size: object.data.len() as u64,
            mtime: object.mtime,
        })
    }
}

impl Drop for SimRados {
    fn drop(&mut self) {
        self.shutdown();
    }
}
