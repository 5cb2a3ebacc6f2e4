//! 测试框架的后期绑定
//!
//! 框架的版本在编译期未知，因此不链接任何框架 API，而是按名称在框架动态库中
//! 查找导出的 C ABI 符号。一个框架"类型" `a.b.TypeName` 对应一组导出符号
//! `a_b_TypeName__<member>`，绑定时先确认所有需要的成员都存在，再调用任何一个。
//!
//! ```text
//! <type>__new()                                  -> *mut c_void
//! <type>__free(this)
//! <type>__collect_and_callback(this, target, cb, user)             -> i32
//! <type>__run_tests_and_callback(this, target, names, n, cb, user) -> i32
//! <partial_name>_public_key_token()              -> *const c_char
//! ```

use crate::error::{ExecutionError, ExecutionResult};
use crate::protocol::{DiscoveredTuple, ExceptionTuple, ResultTuple};
use crate::symbols::qualify_symbol_name;
use libloading::Library;
use log::debug;
use std::any::Any;
use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

pub const NEW_MEMBER: &str = "new";
pub const FREE_MEMBER: &str = "free";
pub const COLLECT_MEMBER: &str = "collect_and_callback";
pub const RUN_MEMBER: &str = "run_tests_and_callback";

#[repr(C)]
#[derive(Debug)]
pub struct NativeTestCase {
    pub full_name: *const c_char,
    pub declaring_type: *const c_char,
    pub member_name: *const c_char,
    pub display_name: *const c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct NativeException {
    pub type_name: *const c_char,
    pub message: *const c_char,
    pub stack_trace: *const c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct NativeTestResult {
    pub case: NativeTestCase,
    pub exceptions: *const NativeException,
    pub exception_count: usize,
    pub skip_messages: *const *const c_char,
    pub skip_count: usize,
    pub failure_messages: *const *const c_char,
    pub failure_count: usize,
    pub duration_nanos: u64,
}

/// 返回 false 表示让框架停止
pub type DiscoveredCallback =
    unsafe extern "C" fn(user: *mut c_void, case: *const NativeTestCase) -> bool;
pub type ResultCallback =
    unsafe extern "C" fn(user: *mut c_void, result: *const NativeTestResult) -> bool;

pub type NewFn = unsafe extern "C" fn() -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(this: *mut c_void);
pub type CollectFn = unsafe extern "C" fn(
    this: *mut c_void,
    target: *const c_char,
    callback: DiscoveredCallback,
    user: *mut c_void,
) -> i32;
pub type RunFn = unsafe extern "C" fn(
    this: *mut c_void,
    target: *const c_char,
    names: *const *const c_char,
    name_count: usize,
    callback: ResultCallback,
    user: *mut c_void,
) -> i32;
pub type TokenFn = unsafe extern "C" fn() -> *const c_char;

/// 能按名称给出导出符号地址的东西
pub trait SymbolSource {
    fn lookup(&self, symbol: &str) -> Option<*const c_void>;
}

/// 通过 libloading 打开的动态库
pub struct NativeLibrary {
    library: Library,
}

impl NativeLibrary {
    pub fn open(path: &Path) -> ExecutionResult<Self> {
        debug!("Loading {}", path.display());
        // SAFETY: 加载的库在隔离上下文中运行，其初始化代码由测试模块作者负责
        let library = unsafe { Library::new(path) }.map_err(|source| ExecutionError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { library })
    }
}

impl SymbolSource for NativeLibrary {
    fn lookup(&self, symbol: &str) -> Option<*const c_void> {
        // SAFETY: 只取地址，调用前由 FrameworkType 转换成对应的函数类型
        let address = unsafe { self.library.get::<*const c_void>(symbol.as_bytes()) }.ok()?;
        let address = *address;
        (!address.is_null()).then_some(address)
    }
}

/// `a.b.Type` + `member` -> `a_b_Type__member`
pub fn member_symbol(type_name: &str, member: &str) -> String {
    format!("{}__{}", type_name.replace('.', "_"), member)
}

/// 读取框架的签名标记；没有导出标记的库视为未签名
pub fn public_key_token<S: SymbolSource + ?Sized>(source: &S, symbol: &str) -> Option<String> {
    let address = source.lookup(symbol)?;
    // SAFETY: 签名标记约定为 `extern "C" fn() -> *const c_char`
    let token_fn = unsafe { std::mem::transmute::<*const c_void, TokenFn>(address) };
    let token = unsafe { token_fn() };
    if token.is_null() {
        return None;
    }
    Some(unsafe { c_string(token) })
}

/// 已绑定的框架类型，所有成员都已确认存在
pub struct FrameworkType<'lib> {
    type_name: String,
    entry_member: String,
    new: NewFn,
    free: FreeFn,
    entry: *const c_void,
    _library: &'lib dyn SymbolSource,
}

impl<'lib> FrameworkType<'lib> {
    pub fn bind(
        library: &'lib dyn SymbolSource,
        type_name: &str,
        entry_member: &str,
    ) -> ExecutionResult<Self> {
        let find = |member: &str| {
            let symbol = member_symbol(type_name, member);
            library
                .lookup(&symbol)
                .ok_or_else(|| ExecutionError::FrameworkVersionMismatch {
                    type_name: type_name.to_string(),
                    member: member.to_string(),
                    symbol,
                })
        };

        let new = find(NEW_MEMBER)?;
        let free = find(FREE_MEMBER)?;
        let entry = find(entry_member)?;
        debug!("Bound {type_name} ({NEW_MEMBER}, {FREE_MEMBER}, {entry_member})");

        Ok(Self {
            type_name: type_name.to_string(),
            entry_member: entry_member.to_string(),
            // SAFETY: 成员签名由导出约定固定
            new: unsafe { std::mem::transmute::<*const c_void, NewFn>(new) },
            free: unsafe { std::mem::transmute::<*const c_void, FreeFn>(free) },
            entry,
            _library: library,
        })
    }

    pub fn instantiate(&self) -> ExecutionResult<FrameworkInstance<'_, 'lib>> {
        let this = unsafe { (self.new)() };
        if this.is_null() {
            return Err(ExecutionError::Instantiate {
                type_name: self.type_name.clone(),
            });
        }
        Ok(FrameworkInstance { ty: self, this })
    }

    fn check_status(&self, status: i32) -> ExecutionResult<()> {
        if status == 0 {
            Ok(())
        } else {
            Err(ExecutionError::FrameworkStatus {
                type_name: self.type_name.clone(),
                member: self.entry_member.clone(),
                status,
            })
        }
    }
}

/// 框架对象实例，离开作用域时调用 `free`
pub struct FrameworkInstance<'t, 'lib> {
    ty: &'t FrameworkType<'lib>,
    this: *mut c_void,
}

impl FrameworkInstance<'_, '_> {
    /// 调用收集器，每发现一个测试回调一次 `handler`
    pub fn collect_and_callback(
        &self,
        target: &str,
        handler: &mut dyn FnMut(DiscoveredTuple) -> bool,
    ) -> ExecutionResult<()> {
        self.expect_entry(COLLECT_MEMBER)?;
        let target = to_c_string(target)?;
        let mut state = CallbackState {
            handler,
            panic: None,
        };

        // SAFETY: bind 时确认了入口成员就是 collect_and_callback
        let collect = unsafe { std::mem::transmute::<*const c_void, CollectFn>(self.ty.entry) };
        let status = unsafe {
            collect(
                self.this,
                target.as_ptr(),
                on_discovered,
                (&mut state as *mut CallbackState<DiscoveredTuple>).cast(),
            )
        };

        state.into_result()?;
        self.ty.check_status(status)
    }

    /// 调用运行器，`names` 为空时运行全部测试
    pub fn run_tests_and_callback(
        &self,
        target: &str,
        names: &[String],
        handler: &mut dyn FnMut(ResultTuple) -> bool,
    ) -> ExecutionResult<()> {
        self.expect_entry(RUN_MEMBER)?;
        let target = to_c_string(target)?;
        let names = names
            .iter()
            .map(|n| to_c_string(n))
            .collect::<ExecutionResult<Vec<_>>>()?;
        let name_ptrs: Vec<*const c_char> = names.iter().map(|n| n.as_ptr()).collect();
        let mut state = CallbackState {
            handler,
            panic: None,
        };

        // SAFETY: bind 时确认了入口成员就是 run_tests_and_callback
        let run = unsafe { std::mem::transmute::<*const c_void, RunFn>(self.ty.entry) };
        let status = unsafe {
            run(
                self.this,
                target.as_ptr(),
                name_ptrs.as_ptr(),
                name_ptrs.len(),
                on_result,
                (&mut state as *mut CallbackState<ResultTuple>).cast(),
            )
        };

        state.into_result()?;
        self.ty.check_status(status)
    }

    fn expect_entry(&self, member: &str) -> ExecutionResult<()> {
        if self.ty.entry_member == member {
            Ok(())
        } else {
            Err(ExecutionError::FrameworkVersionMismatch {
                type_name: self.ty.type_name.clone(),
                member: member.to_string(),
                symbol: member_symbol(&self.ty.type_name, member),
            })
        }
    }
}

impl Drop for FrameworkInstance<'_, '_> {
    fn drop(&mut self) {
        unsafe { (self.ty.free)(self.this) };
    }
}

struct CallbackState<'h, T> {
    handler: &'h mut dyn FnMut(T) -> bool,
    panic: Option<String>,
}

impl<T> CallbackState<'_, T> {
    fn deliver(&mut self, make: impl FnOnce() -> T) -> bool {
        // 已经 panic 过就不再接收
        if self.panic.is_some() {
            return false;
        }
        let handler = &mut *self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler(make()))) {
            Ok(keep_going) => keep_going,
            Err(payload) => {
                self.panic = Some(panic_message(payload.as_ref()));
                false
            }
        }
    }

    fn into_result(self) -> ExecutionResult<()> {
        match self.panic {
            Some(message) => Err(ExecutionError::CallbackPanic(message)),
            None => Ok(()),
        }
    }
}

unsafe extern "C" fn on_discovered(user: *mut c_void, case: *const NativeTestCase) -> bool {
    if user.is_null() {
        return false;
    }
    let state = unsafe { &mut *user.cast::<CallbackState<DiscoveredTuple>>() };
    if case.is_null() {
        return true;
    }
    state.deliver(|| unsafe { discovered_tuple(&*case) })
}

unsafe extern "C" fn on_result(user: *mut c_void, result: *const NativeTestResult) -> bool {
    if user.is_null() {
        return false;
    }
    let state = unsafe { &mut *user.cast::<CallbackState<ResultTuple>>() };
    if result.is_null() {
        return true;
    }
    state.deliver(|| unsafe { result_tuple(&*result) })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn to_c_string(value: &str) -> ExecutionResult<CString> {
    CString::new(value).map_err(|e| ExecutionError::InvalidArgument(format!("{value:?}: {e}")))
}

/// 空指针视为空字符串
unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

unsafe fn c_strings(ptr: *const *const c_char, len: usize) -> Vec<String> {
    unsafe { raw_slice(ptr, len) }
        .iter()
        .map(|p| unsafe { c_string(*p) })
        .collect()
}

unsafe fn discovered_tuple(case: &NativeTestCase) -> DiscoveredTuple {
    let full_name = unsafe { c_string(case.full_name) };
    let declaring_type = unsafe { c_string(case.declaring_type) };
    let member_name = unsafe { c_string(case.member_name) };
    let display_name = unsafe { c_string(case.display_name) };

    let symbol_name = if declaring_type.is_empty() {
        qualify_symbol_name(&member_name)
    } else {
        qualify_symbol_name(&format!("{declaring_type}.{member_name}"))
    };
    let display_name = if display_name.is_empty() {
        full_name.clone()
    } else {
        display_name
    };
    DiscoveredTuple(full_name, symbol_name, display_name)
}

unsafe fn result_tuple(result: &NativeTestResult) -> ResultTuple {
    let DiscoveredTuple(full_name, symbol_name, display_name) =
        unsafe { discovered_tuple(&result.case) };
    let exceptions = unsafe { raw_slice(result.exceptions, result.exception_count) }
        .iter()
        .map(|e| unsafe {
            ExceptionTuple(
                c_string(e.type_name),
                c_string(e.message),
                c_string(e.stack_trace),
            )
        })
        .collect();

    ResultTuple(
        full_name,
        symbol_name,
        display_name,
        exceptions,
        unsafe { c_strings(result.skip_messages, result.skip_count) },
        unsafe { c_strings(result.failure_messages, result.failure_count) },
        result.duration_nanos,
    )
}
