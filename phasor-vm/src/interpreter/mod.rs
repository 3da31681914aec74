//! Instance lifecycle, frame management and opcode dispatch.

mod dispatch;
mod frame;

pub use frame::Frame;

use std::collections::HashMap;
use std::rc::Rc;

use phasor_isa::{PanicReason, Value};

use crate::bytecode::Bytecode;
use crate::consts::MAX_CALL_STACK_DEPTH;
use crate::error::{Result, RuntimeError};

/// A host function invokable from bytecode via `CALL_NATIVE`.
///
/// Native functions are registered once, before any instance runs, and are
/// read-only for the remainder of the VM's lifetime — see
/// [`Vm::register_native`].
pub type NativeFn = Rc<dyn Fn(&[Value], &mut Vm) -> Result<Value>>;

/// An opaque, stable index into the VM's instance table.
///
/// Destroyed slots are never reused, so a stale handle reliably resolves to
/// "no such instance" rather than a different, later instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(u32);

impl InstanceHandle {
    /// The sentinel handle denoting "no instance" — the return target of a
    /// bottom frame.
    pub const NULL: InstanceHandle = InstanceHandle(u32::MAX);

    /// True if this is the [`InstanceHandle::NULL`] sentinel.
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A live (or halted) execution context for one module's bytecode.
pub struct Instance {
    bytecode: Rc<Bytecode>,
    call_stack: Vec<Frame>,
    alive: bool,
    /// Other instances this one is permitted to call into via
    /// `callTrans`/`CALL_NATIVE`-style cross-instance calls.
    pub imports: Vec<InstanceHandle>,
    error: Option<RuntimeError>,
}

impl Instance {
    fn new(bytecode: Rc<Bytecode>) -> Self {
        let locals = vec![Value::Null; bytecode.next_var_index as usize];
        let entry_frame = Frame::new(locals, InstanceHandle::NULL, 0);
        Self { bytecode, call_stack: vec![entry_frame], alive: true, imports: Vec::new(), error: None }
    }

    /// The bytecode this instance is executing.
    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    /// Whether the instance is still runnable. Cleared by `HALT`, by
    /// returning from the bottom frame, or by any fault.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// The fault that stopped this instance, if any.
    pub fn error(&self) -> Option<&RuntimeError> {
        self.error.as_ref()
    }

    /// The currently active frame — the back of the call stack.
    pub fn active_frame(&self) -> &Frame {
        self.call_stack.last().expect("instance always has >= 1 frame")
    }

    fn active_frame_mut(&mut self) -> &mut Frame {
        self.call_stack.last_mut().expect("instance always has >= 1 frame")
    }

    fn push_frame(&mut self, frame: Frame) -> Result<()> {
        if self.call_stack.len() >= MAX_CALL_STACK_DEPTH {
            return Err(RuntimeError::fault(PanicReason::CallStackOverflow, "call stack overflow"));
        }
        self.call_stack.push(frame);
        Ok(())
    }

    fn pop_frame(&mut self) -> Frame {
        self.call_stack.pop().expect("instance always has >= 1 frame")
    }
}

/// The virtual machine: owns every [`Instance`], the native-function
/// registry, and (optionally) a host-installed `IMPORT` handler.
///
/// Shared resources (the instance table, the native registry) are mutated
/// only by the host thread driving `execute`; there is no intra-VM locking,
/// matching the single-threaded cooperative scheduling model.
pub struct Vm {
    instances: Vec<Option<Instance>>,
    natives: HashMap<String, NativeFn>,
    import_handler: Option<Rc<dyn Fn(&str, &mut Vm) -> Result<InstanceHandle>>>,
    current: InstanceHandle,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Creates a VM with no instances and no registered natives.
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
            natives: HashMap::new(),
            import_handler: None,
            current: InstanceHandle::NULL,
        }
    }

    /// Registers a native function callable from bytecode as `CALL_NATIVE
    /// name`. Registering the same name twice replaces the previous
    /// function.
    pub fn register_native<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value], &mut Vm) -> Result<Value> + 'static,
    {
        self.natives.insert(name.into(), Rc::new(f));
    }

    /// Installs the handler backing the `IMPORT` opcode. Absent a handler,
    /// `IMPORT` faults — see [`phasor_isa::Opcode::Import`].
    pub fn set_import_handler<F>(&mut self, f: F)
    where
        F: Fn(&str, &mut Vm) -> Result<InstanceHandle> + 'static,
    {
        self.import_handler = Some(Rc::new(f));
    }

    /// Creates a fresh, empty instance (an empty bytecode, no frames beyond
    /// the implicit bottom one) and returns its handle.
    pub fn create_instance(&mut self) -> InstanceHandle {
        self.load(Rc::new(Bytecode::new()))
    }

    /// Creates a new instance executing `bytecode` and returns its handle.
    pub fn load(&mut self, bytecode: Rc<Bytecode>) -> InstanceHandle {
        let instance = Instance::new(bytecode);
        let index = self.instances.len();
        self.instances.push(Some(instance));
        InstanceHandle(index as u32)
    }

    /// Looks up an instance by handle.
    pub fn instance(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.instances.get(handle.index())?.as_ref()
    }

    /// Looks up an instance by handle, mutably.
    pub fn instance_mut(&mut self, handle: InstanceHandle) -> Option<&mut Instance> {
        self.instances.get_mut(handle.index())?.as_mut()
    }

    /// Permanently invalidates `handle`; its slot is never reused.
    pub fn destroy_instance(&mut self, handle: InstanceHandle) {
        if let Some(slot) = self.instances.get_mut(handle.index()) {
            *slot = None;
        }
    }

    /// The handle of the instance currently at the bottom of the host's
    /// `execute` recursion, or [`InstanceHandle::NULL`] if none is running.
    pub fn current(&self) -> InstanceHandle {
        self.current
    }

    /// Runs `handle`'s dispatch loop until it halts (via `HALT`, via
    /// `RETURN` off the bottom frame, or via a fault). Re-entrant: a native
    /// function or cross-instance call may call `execute` again with a
    /// different handle while an outer call is still on the Rust stack.
    pub fn execute(&mut self, handle: InstanceHandle) -> Result<()> {
        let previous = self.current;
        self.current = handle;
        let result = dispatch::run(self, handle);
        self.current = previous;

        if let Err(err) = &result {
            if let Some(instance) = self.instance_mut(handle) {
                instance.alive = false;
                instance.error = Some(err.clone());
            }
        }
        result
    }

    /// Runs `handle` starting at the named function's entry point rather
    /// than instruction 0 — the module runtime's eager-entry loading path.
    pub fn execute_entry(&mut self, handle: InstanceHandle, entry: &str) -> Result<()> {
        let instance = self
            .instance(handle)
            .ok_or_else(|| RuntimeError::fault(PanicReason::UnknownFunction, "no such instance"))?;
        let pc = *instance.bytecode().function_entries.get(entry).ok_or_else(|| {
            RuntimeError::fault(PanicReason::UnknownFunction, format!("unknown entry function `{entry}`"))
        })?;
        self.instance_mut(handle).expect("checked above").active_frame_mut().pc = pc;
        self.execute(handle)
    }

    /// Calls a function of `handle`'s bytecode by name, outside of `handle`'s
    /// own dispatch loop.
    ///
    /// Used to invoke a module's exported functions — including after its
    /// top-level script has already run to a `HALT`, since a module instance
    /// stays callable for the lifetime of the [`Vm`] regardless of
    /// [`Instance::is_alive`]. Re-entrant with `execute`: a native function
    /// may call this on a different instance while the caller's own
    /// dispatch loop is still on the Rust stack.
    pub fn call_function(&mut self, handle: InstanceHandle, name: &str, args: Vec<Value>) -> Result<Value> {
        let previous = self.current;
        self.current = handle;
        let result = dispatch::call_function(self, handle, name, args);
        self.current = previous;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_not_reused_after_destruction() {
        let mut vm = Vm::new();
        let a = vm.create_instance();
        vm.destroy_instance(a);
        let b = vm.create_instance();
        assert_ne!(a, b);
        assert!(vm.instance(a).is_none());
        assert!(vm.instance(b).is_some());
    }
}
