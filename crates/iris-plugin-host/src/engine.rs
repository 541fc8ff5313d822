use core::ffi::c_void;
use std::ffi::{CStr, CString};
use std::path::Path;
use std::slice;
use std::sync::Arc;

use iris_abi::ffi::*;
use iris_abi::{
    BatchHandle, ContextHandle, ContextParams, Cursor, EngineError, EngineResult, ModelHandle,
    NativeEngine, SamplerHandle, SamplingParams,
};

use crate::error::PluginError;
use crate::loader::{load_plugin, load_plugin_once, LoadedPlugin};

/// A native engine plugin driven through its C vtable.
///
/// Handles are the plugin's raw pointers carried as `usize`.
pub struct PluginEngine {
    plugin: Arc<LoadedPlugin>,
}

fn make_cstring(s: &str) -> EngineResult<CString> {
    CString::new(s).map_err(|_| EngineError::native("string contains interior NUL"))
}

/// Copy a plugin-owned string and hand it back to the plugin.
unsafe fn take_plugin_string(free: FreeStringFn, s: IrisString) -> String {
    if s.ptr.is_null() {
        return String::new();
    }
    // Empty strings may still own an allocation.
    let out = if s.len == 0 {
        String::new()
    } else {
        let bytes = unsafe { slice::from_raw_parts(s.ptr as *const u8, s.len) };
        String::from_utf8_lossy(bytes).into_owned()
    };
    unsafe { free(s) };
    out
}

#[inline]
fn raw(handle: usize) -> *mut c_void {
    handle as *mut c_void
}

fn clamp_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

pub(crate) fn context_params_c(params: &ContextParams) -> ContextParamsC {
    ContextParamsC {
        n_ctx: clamp_u32(params.n_ctx),
        n_threads: clamp_u32(params.n_threads),
        seed: params.seed.unwrap_or(SEED_RANDOM),
    }
}

pub(crate) fn sampling_params_c(params: &SamplingParams) -> SamplingParamsC {
    let p = params.normalized();
    SamplingParamsC {
        temperature: p.temperature.unwrap_or(0.0),
        top_k: p.top_k.and_then(|k| i32::try_from(k).ok()).unwrap_or(0),
        top_p: p.top_p.unwrap_or(0.0),
    }
}

impl PluginEngine {
    pub fn new(plugin: Arc<LoadedPlugin>) -> Self {
        Self { plugin }
    }

    /// Use the process-wide plugin (`IRIS_ENGINE_PLUGIN`, or next to the executable).
    pub fn from_env() -> Result<Self, &'static PluginError> {
        load_plugin_once().map(Self::new)
    }

    pub fn open(path: &Path) -> Result<Self, PluginError> {
        load_plugin(path).map(|p| Self::new(Arc::new(p)))
    }

    fn api(&self) -> &EngineApi {
        self.plugin.api
    }

    /// Plugin id and version, e.g. `("llama", "0.3.1")`.
    pub fn describe(&self) -> (String, String) {
        let read = |p: *const core::ffi::c_char| {
            if p.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
            }
        };
        let info = &self.api().info;
        (read(info.id), read(info.semver))
    }

    fn last_error(&self, fallback: &str) -> EngineError {
        let msg = unsafe {
            let s = (self.api().last_error)();
            take_plugin_string(self.api().free_string, s)
        };
        if msg.is_empty() {
            EngineError::native(fallback)
        } else {
            EngineError::Native(msg)
        }
    }

    fn non_null(&self, ptr: *mut c_void, what: &str) -> EngineResult<usize> {
        if ptr.is_null() {
            Err(self.last_error(&format!("{what} failed")))
        } else {
            Ok(ptr as usize)
        }
    }
}

impl NativeEngine for PluginEngine {
    fn backend_init(&mut self) -> EngineResult<()> {
        let rc = unsafe { (self.api().backend_init)() };
        if rc == ERR_OK {
            Ok(())
        } else {
            Err(self.last_error("backend_init failed"))
        }
    }

    fn backend_free(&mut self) {
        unsafe { (self.api().backend_free)() };
    }

    fn load_model(&mut self, path: &Path) -> EngineResult<ModelHandle> {
        let path = path
            .to_str()
            .ok_or_else(|| EngineError::native("model path not valid UTF-8"))?;
        let cpath = make_cstring(path)?;
        let ptr = unsafe { (self.api().load_model)(cpath.as_ptr()) };
        self.non_null(ptr, "load_model").map(ModelHandle)
    }

    fn free_model(&mut self, model: ModelHandle) {
        unsafe { (self.api().free_model)(raw(model.0)) };
    }

    fn new_context(
        &mut self,
        model: ModelHandle,
        params: &ContextParams,
    ) -> EngineResult<ContextHandle> {
        let c = context_params_c(params);
        let ptr = unsafe { (self.api().new_context)(raw(model.0), &c) };
        self.non_null(ptr, "new_context").map(ContextHandle)
    }

    fn free_context(&mut self, context: ContextHandle) {
        unsafe { (self.api().free_context)(raw(context.0)) };
    }

    fn new_batch(&mut self, max_tokens: usize) -> EngineResult<BatchHandle> {
        let ptr = unsafe { (self.api().new_batch)(clamp_u32(max_tokens)) };
        self.non_null(ptr, "new_batch").map(BatchHandle)
    }

    fn free_batch(&mut self, batch: BatchHandle) {
        unsafe { (self.api().free_batch)(raw(batch.0)) };
    }

    fn new_sampler(&mut self, params: &SamplingParams) -> EngineResult<SamplerHandle> {
        let c = sampling_params_c(params);
        let ptr = unsafe { (self.api().new_sampler)(&c) };
        self.non_null(ptr, "new_sampler").map(SamplerHandle)
    }

    fn free_sampler(&mut self, sampler: SamplerHandle) {
        unsafe { (self.api().free_sampler)(raw(sampler.0)) };
    }

    fn end_of_turn_marker(&mut self, model: ModelHandle) -> EngineResult<String> {
        let mut out = IrisString::empty();
        let rc = unsafe { (self.api().end_of_turn_marker)(raw(model.0), &mut out) };
        if rc != ERR_OK {
            return Err(self.last_error("end_of_turn_marker failed"));
        }
        Ok(unsafe { take_plugin_string(self.api().free_string, out) })
    }

    fn init_generation(
        &mut self,
        context: ContextHandle,
        batch: BatchHandle,
        prompt: &str,
        max_len: usize,
    ) -> EngineResult<Cursor> {
        let cprompt = make_cstring(prompt)?;
        let pos = unsafe {
            (self.api().init_generation)(
                raw(context.0),
                raw(batch.0),
                cprompt.as_ptr(),
                clamp_u32(max_len),
            )
        };
        usize::try_from(pos)
            .map(Cursor)
            .map_err(|_| self.last_error("init_generation failed"))
    }

    fn next_token(
        &mut self,
        context: ContextHandle,
        batch: BatchHandle,
        sampler: SamplerHandle,
        max_len: usize,
        cursor: &mut Cursor,
    ) -> EngineResult<Option<String>> {
        let mut pos = i64::try_from(cursor.position()).unwrap_or(i64::MAX);
        let mut out = IrisString::empty();
        let rc = unsafe {
            (self.api().next_token)(
                raw(context.0),
                raw(batch.0),
                raw(sampler.0),
                clamp_u32(max_len),
                &mut pos,
                &mut out,
            )
        };

        match rc {
            TOKEN_READY => {
                *cursor = Cursor(usize::try_from(pos).unwrap_or(cursor.position() + 1));
                Ok(Some(unsafe { take_plugin_string(self.api().free_string, out) }))
            }
            TOKEN_EOS => Ok(None),
            _ => Err(self.last_error("next_token failed")),
        }
    }

    fn reset_cache(&mut self, context: ContextHandle) {
        unsafe { (self.api().reset_cache)(raw(context.0)) };
    }

    fn embed(&mut self, context: ContextHandle, text: &str) -> EngineResult<Vec<f32>> {
        let Some(embed) = self.api().embed else {
            return Err(EngineError::Unsupported("embed"));
        };
        let ctext = make_cstring(text)?;
        let mut arr = FloatArray {
            ptr: core::ptr::null_mut(),
            len: 0,
        };
        let rc = unsafe { embed(raw(context.0), ctext.as_ptr(), &mut arr) };
        if rc != ERR_OK {
            return Err(self.last_error("embed failed"));
        }
        if arr.ptr.is_null() {
            return Ok(Vec::new());
        }
        let v = if arr.len == 0 {
            Vec::new()
        } else {
            unsafe { slice::from_raw_parts(arr.ptr, arr.len) }.to_vec()
        };
        unsafe { (self.api().free_floats)(arr) };
        Ok(v)
    }
}
