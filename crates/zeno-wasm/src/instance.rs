//! Guest instances and the linear-memory string protocol.
//!
//! Structured data crosses the boundary as UTF-8 bytes in guest memory:
//!
//! 1. The host asks the guest's `alloc(size) -> ptr` export for a buffer
//! 2. The host copies the bytes in and passes `(ptr, len)` to the export
//! 3. The export returns a pointer to a NUL-terminated reply, or 0
//!
//! Host functions use the same protocol in reverse through [`read_guest`]
//! and [`write_guest_cstr`].

use std::time::Instant;

use tracing::{debug, instrument, warn};
use wasmtime::{Caller, Instance, Linker, Memory, Store, Trap, TypedFunc, Val};

use crate::store::{GuestState, calculate_fuel_consumed, create_store, get_remaining_fuel, refuel};
use crate::{CompiledModule, WasmEngine};
use zeno_common::{ExecutionConfig, HostFunctionError, RuntimeError};

/// Upper bound on a NUL-terminated reply read back from a guest.
pub const MAX_GUEST_STRING: usize = 16 * 1024 * 1024;

/// An instantiated guest with its own store.
///
/// Calls are serialized by `&mut self`; embedders share an instance behind
/// an async mutex.
pub struct GuestInstance<H: 'static> {
    store: Store<GuestState<H>>,
    instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    engine: WasmEngine,
    config: ExecutionConfig,
    poisoned: bool,
}

impl<H: Send + 'static> GuestInstance<H> {
    /// Instantiate `module` with the host functions in `linker`.
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` when instantiation fails or the guest does
    /// not export `memory` and `alloc`.
    #[instrument(skip_all, fields(content_hash = %module.content_hash()))]
    pub async fn instantiate(
        engine: &WasmEngine,
        module: &CompiledModule,
        linker: &Linker<GuestState<H>>,
        config: &ExecutionConfig,
        host: H,
    ) -> Result<Self, RuntimeError> {
        let mut store = create_store(engine, config, host)?;
        let instance = linker
            .instantiate_async(&mut store, module.module())
            .await
            .map_err(|e| RuntimeError::compilation_failed(format!("Instantiation failed: {e}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| RuntimeError::compilation_failed("guest does not export `memory`"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| {
                RuntimeError::compilation_failed(format!("guest `alloc(i32) -> i32` missing: {e}"))
            })?;

        debug!("guest instantiated");
        Ok(Self {
            store,
            instance,
            memory,
            alloc,
            engine: engine.clone(),
            config: config.clone(),
            poisoned: false,
        })
    }

    pub fn host(&self) -> &H {
        &self.store.data().host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.store.data_mut().host
    }

    pub fn state(&self) -> &GuestState<H> {
        self.store.data()
    }

    /// A trap or a timeout left the guest in an unknown state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    /// Run a guest export with a fresh budget.
    ///
    /// Every buffer is copied into guest memory and passed as a
    /// `(ptr, len)` pair, in order. Returns the export's first `i32`
    /// result, if it has one.
    ///
    /// # Errors
    ///
    /// Returns `FuelExhausted`, `Timeout` or `Trap`; each poisons the
    /// instance.
    pub async fn invoke(
        &mut self,
        export: &str,
        buffers: &[&[u8]],
        request_id: String,
    ) -> Result<Option<i32>, RuntimeError> {
        refuel(&mut self.store, &self.engine, &self.config)?;
        self.store.data_mut().begin_call(request_id);
        let initial_fuel = get_remaining_fuel(&self.store).unwrap_or(0);
        let start = Instant::now();

        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(timeout, self.invoke_inner(export, buffers)).await
        {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout {
                duration_ms: self.config.timeout_ms,
            }),
        };

        let fuel_consumed = calculate_fuel_consumed(initial_fuel, &self.store);
        let memory_used = self.memory.data_size(&self.store);
        let state = self.store.data_mut();
        state.metrics.fuel_consumed = fuel_consumed;
        state.metrics.memory_used_bytes = memory_used;
        state.finalize_metrics();

        if let Err(e) = &result {
            self.poisoned = true;
            warn!(
                export,
                error = %e,
                fuel_consumed,
                duration_ms = start.elapsed().as_millis(),
                "guest call failed"
            );
        } else {
            debug!(
                export,
                fuel_consumed,
                duration_ms = start.elapsed().as_millis(),
                "guest call completed"
            );
        }
        result
    }

    async fn invoke_inner(
        &mut self,
        export: &str,
        buffers: &[&[u8]],
    ) -> Result<Option<i32>, RuntimeError> {
        let mut args = Vec::with_capacity(buffers.len() * 2);
        for bytes in buffers {
            let (ptr, len) = self.write_bytes(bytes).await?;
            args.push(ptr);
            args.push(len);
        }
        self.call_export(export, &args).await
    }

    /// Call an export with `i32` arguments, without resetting the budget.
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` for a missing export and a trap error
    /// when the guest traps.
    pub async fn call_export(
        &mut self,
        export: &str,
        args: &[i32],
    ) -> Result<Option<i32>, RuntimeError> {
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| {
                RuntimeError::compilation_failed(format!("guest does not export `{export}`"))
            })?;
        let result_count = func.ty(&self.store).results().len();
        let params: Vec<Val> = args.iter().map(|a| Val::I32(*a)).collect();
        let mut results = vec![Val::I32(0); result_count];

        func.call_async(&mut self.store, &params, &mut results)
            .await
            .map_err(|e| trap_to_error(&e))?;

        Ok(results.first().and_then(Val::i32))
    }

    /// Copy `bytes` into a fresh guest allocation.
    ///
    /// # Errors
    ///
    /// Returns a trap error if `alloc` traps or returns an out-of-bounds
    /// pointer.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(i32, i32), RuntimeError> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| RuntimeError::trap("buffer exceeds guest address space"))?;
        let ptr = self
            .alloc
            .call_async(&mut self.store, len)
            .await
            .map_err(|e| trap_to_error(&e))?;
        let offset = usize::try_from(ptr)
            .map_err(|_| RuntimeError::trap(format!("alloc returned negative pointer {ptr}")))?;
        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|e| RuntimeError::trap(format!("write to guest memory failed: {e}")))?;
        Ok((ptr, len))
    }

    /// Read `len` bytes at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns a trap error when the range lies outside guest memory.
    pub fn read_bytes(&self, ptr: i32, len: i32) -> Result<Vec<u8>, RuntimeError> {
        slice(self.memory.data(&self.store), ptr, len)
            .map(<[u8]>::to_vec)
            .map_err(|e| RuntimeError::trap(e.to_string()))
    }

    /// Read the NUL-terminated string at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns a trap error for an out-of-bounds pointer, a missing
    /// terminator or invalid UTF-8.
    pub fn read_cstr(&self, ptr: i32) -> Result<String, RuntimeError> {
        cstr(self.memory.data(&self.store), ptr).map_err(|e| RuntimeError::trap(e.to_string()))
    }
}

impl<H> std::fmt::Debug for GuestInstance<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

/// Map a failed guest call to a runtime error.
pub fn trap_to_error(error: &wasmtime::Error) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeError::FuelExhausted,
        Some(trap) => RuntimeError::trap(format!("{trap}: {error}")),
        None => RuntimeError::trap(error.to_string()),
    }
}

fn slice(data: &[u8], ptr: i32, len: i32) -> Result<&[u8], HostFunctionError> {
    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(invalid(format!("negative pointer or length ({ptr}, {len})")));
    };
    let end = start
        .checked_add(len)
        .ok_or_else(|| invalid("pointer + length overflow"))?;
    data.get(start..end).ok_or_else(|| {
        invalid(format!(
            "range {start}..{end} outside guest memory of {} bytes",
            data.len()
        ))
    })
}

fn cstr(data: &[u8], ptr: i32) -> Result<String, HostFunctionError> {
    let start = usize::try_from(ptr).map_err(|_| invalid(format!("negative pointer {ptr}")))?;
    let tail = data
        .get(start..)
        .ok_or_else(|| invalid(format!("pointer {start} outside guest memory")))?;
    let window = &tail[..tail.len().min(MAX_GUEST_STRING)];
    let end = window
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| invalid("guest string is not NUL-terminated"))?;
    std::str::from_utf8(&window[..end])
        .map(str::to_string)
        .map_err(|_| invalid("guest string is not valid UTF-8"))
}

fn invalid(reason: impl Into<String>) -> HostFunctionError {
    HostFunctionError::InvalidArgument {
        reason: reason.into(),
    }
}

fn caller_memory<T>(caller: &mut Caller<'_, T>) -> Result<Memory, HostFunctionError> {
    caller
        .get_export("memory")
        .and_then(wasmtime::Extern::into_memory)
        .ok_or_else(|| invalid("memory export not found in guest module"))
}

/// Read `(ptr, len)` out of the calling guest's memory.
///
/// # Errors
///
/// Returns `InvalidArgument` for an out-of-bounds range.
pub fn read_guest<T>(
    caller: &mut Caller<'_, T>,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, HostFunctionError> {
    let memory = caller_memory(caller)?;
    slice(memory.data(&*caller), ptr, len).map(<[u8]>::to_vec)
}

/// Copy `bytes` plus a NUL terminator into the calling guest's memory.
///
/// # Errors
///
/// Returns `InvalidArgument` when the guest has no usable `alloc` or
/// the allocation is out of bounds.
pub async fn write_guest_cstr<T: Send>(
    caller: &mut Caller<'_, T>,
    bytes: &[u8],
) -> Result<i32, HostFunctionError> {
    let memory = caller_memory(caller)?;
    let alloc = caller
        .get_export("alloc")
        .and_then(wasmtime::Extern::into_func)
        .ok_or_else(|| invalid("alloc export not found in guest module"))?
        .typed::<i32, i32>(&*caller)
        .map_err(|e| invalid(format!("alloc has the wrong signature: {e}")))?;

    let size = i32::try_from(bytes.len() + 1).map_err(|_| invalid("reply too large"))?;
    let ptr = alloc
        .call_async(&mut *caller, size)
        .await
        .map_err(|e| invalid(format!("alloc trapped: {e}")))?;
    let offset = usize::try_from(ptr).map_err(|_| invalid("alloc returned a negative pointer"))?;

    let mut buffer = Vec::with_capacity(bytes.len() + 1);
    buffer.extend_from_slice(bytes);
    buffer.push(0);
    memory
        .write(&mut *caller, offset, &buffer)
        .map_err(|e| invalid(format!("write to guest memory failed: {e}")))?;
    Ok(ptr)
}
