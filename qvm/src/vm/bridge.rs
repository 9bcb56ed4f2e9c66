use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::trace;

use super::{FaultKind, Instance, MAX_VMSYSCALL_ARGS, SandboxMemory, VmResult};
use crate::registry::{RegistryError, VmHandle, VmRegistry};

/// Words passed to a syscall handler. Word 0 is the syscall id; the guest
/// arguments follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallArgs {
    words: [i32; MAX_VMSYSCALL_ARGS],
}

impl SyscallArgs {
    pub fn new(id: u32, args: &[i32]) -> Self {
        let mut words = [0; MAX_VMSYSCALL_ARGS];
        words[0] = id as i32;
        for (slot, value) in words[1..].iter_mut().zip(args) {
            *slot = *value;
        }
        Self { words }
    }

    pub fn id(&self) -> u32 {
        self.words[0] as u32
    }

    /// Guest argument `n`, counted from zero after the id. Missing
    /// arguments read as zero.
    pub fn arg(&self, n: usize) -> i32 {
        self.words.get(n + 1).copied().unwrap_or(0)
    }

    /// Guest argument `n` as a sandbox address.
    pub fn addr(&self, n: usize) -> u32 {
        self.arg(n) as u32
    }

    pub fn float(&self, n: usize) -> f32 {
        word_to_float(self.arg(n))
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.words
    }
}

/// Bit pattern of `value`, for returning floats from handlers.
pub fn float_to_word(value: f32) -> i32 {
    value.to_bits() as i32
}

pub fn word_to_float(word: i32) -> f32 {
    f32::from_bits(word as u32)
}

pub trait SyscallHandler {
    fn call(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32>;
}

impl<F> SyscallHandler for F
where
    F: Fn(&mut SyscallContext<'_>, &SyscallArgs) -> VmResult<i32>,
{
    fn call(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
        self(ctx, args)
    }
}

struct SyscallEntry {
    name: String,
    handler: Box<dyn SyscallHandler>,
}

/// Host functions reachable from guest code, keyed by syscall id.
#[derive(Default)]
pub struct SyscallTable {
    entries: BTreeMap<u32, SyscallEntry>,
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, entry)| (id, &entry.name)))
            .finish()
    }
}

impl SyscallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: u32, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut SyscallContext<'_>, &SyscallArgs) -> VmResult<i32> + 'static,
    {
        self.register_handler(id, name, Box::new(handler));
    }

    /// Registers `handler` under `id`, replacing any previous entry.
    pub fn register_handler(
        &mut self,
        id: u32,
        name: impl Into<String>,
        handler: Box<dyn SyscallHandler>,
    ) {
        self.entries.insert(
            id,
            SyscallEntry {
                name: name.into(),
                handler,
            },
        );
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(|entry| entry.name.as_str())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dispatch(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
        let entry = self
            .entries
            .get(&args.id())
            .ok_or(FaultKind::UnknownSyscall(args.id()))?;
        entry.handler.call(ctx, args)
    }

    pub fn into_shared(self) -> Rc<Self> {
        Rc::new(self)
    }
}

/// What a syscall handler can reach: the calling instance's sandbox and the
/// registry, for nested calls.
pub struct SyscallContext<'a> {
    registry: &'a mut VmRegistry,
    /// Shared with the registry's parked stack so nested calls back into
    /// this instance reach it through the same pointer.
    instance: *mut Instance,
    handle: VmHandle,
    _instance: PhantomData<&'a mut Instance>,
}

impl<'a> SyscallContext<'a> {
    pub fn handle(&self) -> VmHandle {
        self.handle
    }

    pub fn instance(&self) -> &Instance {
        // SAFETY: the pointer comes from the `&mut Instance` held by the
        // dispatch that built this context; nested calls only use it while
        // this context is borrowed for the call.
        unsafe { &*self.instance }
    }

    fn instance_mut(&mut self) -> &mut Instance {
        // SAFETY: as in `instance`.
        unsafe { &mut *self.instance }
    }

    pub fn memory(&self) -> &SandboxMemory {
        &self.instance().memory
    }

    pub fn memory_mut(&mut self) -> &mut SandboxMemory {
        &mut self.instance_mut().memory
    }

    /// Active calls across all instances, this one included.
    pub fn depth(&self) -> usize {
        self.registry.depth()
    }

    pub fn read_string(&self, addr: u32) -> VmResult<String> {
        Ok(self.memory().read_string(addr)?)
    }

    /// Calls the entry point of `handle`. Instances waiting further up the
    /// chain, the caller included, run nested below their parked frames.
    pub fn call(&mut self, handle: VmHandle, args: &[i32]) -> VmResult<i32> {
        self.registry.call(handle, args)
    }

    pub fn call_routine(
        &mut self,
        handle: VmHandle,
        instruction: u32,
        args: &[i32],
    ) -> VmResult<i32> {
        self.registry.call_routine(handle, instruction, args)
    }

    /// Unloads an idle instance. The caller and every instance suspended
    /// further up the chain report `InstanceBusy`.
    pub fn unload(&mut self, handle: VmHandle) -> Result<(), RegistryError> {
        self.registry.unload(handle)
    }
}

/// Services a guest CALL to a negative target. `program_stack` is the
/// caller's frame; the return address is already stored at its base.
pub(super) fn dispatch_syscall(
    instance: &mut Instance,
    registry: &mut VmRegistry,
    handle: VmHandle,
    program_stack: u32,
    target: i32,
) -> VmResult<i32> {
    let id = !target as u32;
    instance
        .memory
        .write_i32(program_stack.wrapping_add(4), id as i32);
    let mut words = [0i32; MAX_VMSYSCALL_ARGS];
    words[0] = id as i32;
    for (index, word) in words.iter_mut().enumerate().skip(1) {
        let addr = program_stack.wrapping_add(4 + 4 * index as u32);
        *word = instance.memory.read_i32(addr);
    }
    let args = SyscallArgs { words };

    let table = Rc::clone(&instance.syscalls);
    trace!(
        "{} syscall {id} ({})",
        instance.name,
        table.name(id).unwrap_or("unregistered")
    );

    // nested entries build their frames below the caller's
    let saved = instance.program_stack;
    instance.program_stack = program_stack.wrapping_sub(4);
    let parked: *mut Instance = &mut *instance;
    registry.park(handle, parked);
    let result = {
        let mut ctx = SyscallContext {
            registry: &mut *registry,
            instance: parked,
            handle,
            _instance: PhantomData,
        };
        table.dispatch(&mut ctx, &args)
    };
    registry.unpark(handle);
    instance.program_stack = saved;
    result
}
