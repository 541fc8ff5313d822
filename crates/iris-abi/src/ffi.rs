use core::ffi::{c_char, c_void};

/// Bump this when you break the ABI. Host checks it at load time.
pub const IRIS_ABI_VERSION: u32 = 1;

pub const ENGINE_ENTRY_SYMBOL: &str = "iris_engine_entry_v1";

pub const ERR_OK: i32 = 0;
pub const ERR_FAIL: i32 = -1;

/// `next_token` return code: a token was written to `out`.
pub const TOKEN_READY: i32 = 0;
/// `next_token` return code: natural end of sequence, `out` untouched.
pub const TOKEN_EOS: i32 = 1;

/// Sentinel for "no seed" in `ContextParamsC::seed`.
pub const SEED_RANDOM: u64 = u64::MAX;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IrisString {
    pub ptr: *mut c_char,
    pub len: usize,
}

impl IrisString {
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            len: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FloatArray {
    pub ptr: *mut f32,
    pub len: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ContextParamsC {
    pub n_ctx: u32,
    pub n_threads: u32,
    pub seed: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SamplingParamsC {
    /// <= 0 disables.
    pub temperature: f32,
    /// < 1 disables.
    pub top_k: i32,
    /// outside (0, 1] disables.
    pub top_p: f32,
}

#[repr(C)]
pub struct EngineInfo {
    pub abi_version: u32,
    pub id: *const c_char,     // "llama"
    pub semver: *const c_char, // "0.1.0"
}

// ---------- Function pointer types (C ABI) ----------

pub type BackendInitFn = unsafe extern "C" fn() -> i32;
pub type BackendFreeFn = unsafe extern "C" fn();

/// Returns null on failure (see `last_error`).
pub type LoadModelFn = unsafe extern "C" fn(path: *const c_char) -> *mut c_void;
pub type FreeModelFn = unsafe extern "C" fn(model: *mut c_void);

pub type NewContextFn =
    unsafe extern "C" fn(model: *mut c_void, params: *const ContextParamsC) -> *mut c_void;
pub type FreeContextFn = unsafe extern "C" fn(context: *mut c_void);

pub type NewBatchFn = unsafe extern "C" fn(max_tokens: u32) -> *mut c_void;
pub type FreeBatchFn = unsafe extern "C" fn(batch: *mut c_void);

pub type NewSamplerFn = unsafe extern "C" fn(params: *const SamplingParamsC) -> *mut c_void;
pub type FreeSamplerFn = unsafe extern "C" fn(sampler: *mut c_void);

/// Returns ERR_OK and writes `out`, or a negative error code.
pub type EndOfTurnMarkerFn = unsafe extern "C" fn(model: *mut c_void, out: *mut IrisString) -> i32;

/// Returns the cursor (>= 0) or a negative error code.
pub type InitGenerationFn = unsafe extern "C" fn(
    context: *mut c_void,
    batch: *mut c_void,
    prompt: *const c_char,
    max_len: u32,
) -> i64;

/// Returns TOKEN_READY (writes `out`, advances `cursor`), TOKEN_EOS, or a negative error code.
pub type NextTokenFn = unsafe extern "C" fn(
    context: *mut c_void,
    batch: *mut c_void,
    sampler: *mut c_void,
    max_len: u32,
    cursor: *mut i64,
    out: *mut IrisString,
) -> i32;

pub type ResetCacheFn = unsafe extern "C" fn(context: *mut c_void);

/// Optional: ERR_OK and writes `out`, or a negative error code.
pub type EmbedFn =
    unsafe extern "C" fn(context: *mut c_void, text: *const c_char, out: *mut FloatArray) -> i32;

pub type LastErrorFn = unsafe extern "C" fn() -> IrisString;
pub type FreeStringFn = unsafe extern "C" fn(s: IrisString);
pub type FreeFloatsFn = unsafe extern "C" fn(arr: FloatArray);

// ---------- VTable ----------

#[repr(C)]
pub struct EngineApi {
    pub info: EngineInfo,

    pub backend_init: BackendInitFn,
    pub backend_free: BackendFreeFn,

    pub load_model: LoadModelFn,
    pub free_model: FreeModelFn,
    pub new_context: NewContextFn,
    pub free_context: FreeContextFn,
    pub new_batch: NewBatchFn,
    pub free_batch: FreeBatchFn,
    pub new_sampler: NewSamplerFn,
    pub free_sampler: FreeSamplerFn,
    pub end_of_turn_marker: EndOfTurnMarkerFn,

    pub init_generation: InitGenerationFn,
    pub next_token: NextTokenFn,
    pub reset_cache: ResetCacheFn,

    /// May be null when the engine has no embedding support.
    pub embed: Option<EmbedFn>,

    // Diagnostics & memory management
    pub last_error: LastErrorFn,
    pub free_string: FreeStringFn,
    pub free_floats: FreeFloatsFn,
}

/// Plugin must export `iris_engine_entry_v1` returning a pointer to a static `EngineApi`.
pub type EngineEntryFn = unsafe extern "C" fn() -> *const EngineApi;
