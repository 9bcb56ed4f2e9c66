use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::config::{ExecutionMode, VmConfig};
use crate::vm::{FaultKind, Instance, SyscallTable, VmResult};
use crate::wire::{BytecodeImage, LoadError, decode_image};

/// Opaque reference to a loaded instance. Handles of unloaded instances
/// may be reused by later loads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmHandle(u32);

impl VmHandle {
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidHandle(VmHandle),
    InstanceBusy(VmHandle),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidHandle(handle) => write!(f, "no instance loaded at {handle}"),
            RegistryError::InstanceBusy(handle) => write!(f, "{handle} is running"),
        }
    }
}

impl std::error::Error for RegistryError {}

enum Slot {
    Vacant,
    Idle(Box<Instance>),
    /// Checked out for a call; the instance lives on the host stack.
    Running { name: String },
}

/// Owns every loaded instance and tracks the nesting of calls among them.
pub struct VmRegistry {
    config: VmConfig,
    slots: Vec<Slot>,
    depth: usize,
    /// Instances parked in a syscall, innermost last. Each pointer stays
    /// valid until the dispatch that pushed it pops it again.
    suspended: Vec<(VmHandle, *mut Instance)>,
}

impl std::fmt::Debug for VmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Vacant => None,
                Slot::Idle(instance) => Some(instance.name()),
                Slot::Running { name } => Some(name.as_str()),
            })
            .collect();
        f.debug_struct("VmRegistry")
            .field("mode", &self.config.mode)
            .field("instances", &names)
            .field("depth", &self.depth)
            .finish()
    }
}

impl Default for VmRegistry {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}

impl VmRegistry {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            depth: 0,
            suspended: Vec::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Active calls across all instances.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn load(
        &mut self,
        name: &str,
        bytes: &[u8],
        syscalls: Rc<SyscallTable>,
    ) -> Result<VmHandle, LoadError> {
        let image = decode_image(bytes)?;
        self.load_image(name, image, syscalls)
    }

    /// Builds an instance for `image`. In compiled mode a failed translation
    /// falls back to the interpreter.
    pub fn load_image(
        &mut self,
        name: &str,
        image: BytecodeImage,
        syscalls: Rc<SyscallTable>,
    ) -> Result<VmHandle, LoadError> {
        let mut instance = Instance::new(name, image, &self.config, syscalls)?;
        if self.config.mode == ExecutionMode::Compiled {
            if let Err(err) = instance.compile(&self.config) {
                warn!("{name}: native compilation failed, interpreting instead: {err}");
            }
        }
        info!(
            "loaded {name}: {} instructions, {} bytes of sandbox, {}",
            instance.image().instruction_count(),
            instance.memory().size(),
            if instance.is_compiled() { "compiled" } else { "interpreted" }
        );

        let instance = Box::new(instance);
        let index = match self.slots.iter().position(|slot| matches!(slot, Slot::Vacant)) {
            Some(index) => {
                self.slots[index] = Slot::Idle(instance);
                index
            }
            None => {
                self.slots.push(Slot::Idle(instance));
                self.slots.len() - 1
            }
        };
        Ok(VmHandle(index as u32))
    }

    pub fn unload(&mut self, handle: VmHandle) -> Result<(), RegistryError> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(RegistryError::InvalidHandle(handle))?;
        match slot {
            Slot::Vacant => Err(RegistryError::InvalidHandle(handle)),
            Slot::Running { .. } => Err(RegistryError::InstanceBusy(handle)),
            Slot::Idle(instance) => {
                info!("unloaded {} ({handle})", instance.name());
                *slot = Slot::Vacant;
                Ok(())
            }
        }
    }

    /// Unloads every idle instance and returns how many went away.
    pub fn shutdown(&mut self) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            if matches!(slot, Slot::Idle(_)) {
                *slot = Slot::Vacant;
                count += 1;
            }
        }
        if count > 0 {
            debug!("registry shut down {count} instances");
        }
        count
    }

    pub fn handles(&self) -> Vec<VmHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !matches!(slot, Slot::Vacant))
            .map(|(index, _)| VmHandle(index as u32))
            .collect()
    }

    /// The instance behind `handle`, unless it is vacant or mid-call.
    pub fn instance(&self, handle: VmHandle) -> Option<&Instance> {
        match self.slots.get(handle.index()) {
            Some(Slot::Idle(instance)) => Some(instance),
            _ => None,
        }
    }

    pub fn instance_mut(&mut self, handle: VmHandle) -> Option<&mut Instance> {
        match self.slots.get_mut(handle.index()) {
            Some(Slot::Idle(instance)) => Some(instance),
            _ => None,
        }
    }

    /// True while `handle` has a call in progress, including while it is
    /// parked in a syscall waiting on a nested call.
    pub fn is_running(&self, handle: VmHandle) -> bool {
        matches!(self.slots.get(handle.index()), Some(Slot::Running { .. }))
    }

    /// Calls the image entry point with `args` (command word first).
    pub fn call(&mut self, handle: VmHandle, args: &[i32]) -> VmResult<i32> {
        self.invoke(handle, None, args)
    }

    /// Calls the routine starting at `instruction`.
    pub fn call_routine(
        &mut self,
        handle: VmHandle,
        instruction: u32,
        args: &[i32],
    ) -> VmResult<i32> {
        self.invoke(handle, Some(instruction), args)
    }

    fn invoke(&mut self, handle: VmHandle, start: Option<u32>, args: &[i32]) -> VmResult<i32> {
        if self.depth >= self.config.max_nesting {
            return Err(FaultKind::NestingTooDeep {
                limit: self.config.max_nesting,
            }
            .into());
        }
        if let Some(parked) = self.parked(handle) {
            // SAFETY: the dispatch that parked this instance is further down
            // the host stack and only touches it through this same pointer
            // once the nested call has returned.
            let instance = unsafe { &mut *parked };
            let start = start.unwrap_or_else(|| instance.image().entry());
            return self.run_active(instance, handle, start, args);
        }
        let mut instance = self.check_out(handle)?;
        let start = start.unwrap_or_else(|| instance.image().entry());
        let saved_depth = self.depth;
        let saved_parked = self.suspended.len();
        let saved_stack = instance.program_stack();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.run_active(&mut instance, handle, start, args)
        }));
        match outcome {
            Ok(result) => {
                if let Err(err) = &result {
                    debug!("{} ({handle}) faulted: {err}", instance.name());
                }
                self.check_in(handle, instance);
                result
            }
            Err(payload) => {
                // a host handler panicked; leave the registry usable
                self.depth = saved_depth;
                self.suspended.truncate(saved_parked);
                instance.restore_program_stack(saved_stack);
                self.check_in(handle, instance);
                resume_unwind(payload)
            }
        }
    }

    /// Runs a call on an instance the caller already holds: either checked
    /// out by `invoke` or parked in a syscall further up the chain.
    fn run_active(
        &mut self,
        instance: &mut Instance,
        handle: VmHandle,
        start: u32,
        args: &[i32],
    ) -> VmResult<i32> {
        if self.depth >= self.config.max_nesting {
            return Err(FaultKind::NestingTooDeep {
                limit: self.config.max_nesting,
            }
            .into());
        }
        self.depth += 1;
        let result = instance.execute(self, handle, start, args);
        self.depth -= 1;
        result
    }

    /// Records that `instance` is waiting on a syscall, so nested calls to
    /// `handle` run it in place instead of reporting it busy.
    pub(crate) fn park(&mut self, handle: VmHandle, instance: *mut Instance) {
        self.suspended.push((handle, instance));
    }

    pub(crate) fn unpark(&mut self, handle: VmHandle) {
        if let Some(index) = self.suspended.iter().rposition(|(parked, _)| *parked == handle) {
            self.suspended.truncate(index);
        }
    }

    fn parked(&self, handle: VmHandle) -> Option<*mut Instance> {
        self.suspended
            .iter()
            .rev()
            .find(|(parked, _)| *parked == handle)
            .map(|(_, instance)| *instance)
    }

    fn check_out(&mut self, handle: VmHandle) -> VmResult<Box<Instance>> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(FaultKind::InvalidHandle)?;
        match std::mem::replace(slot, Slot::Vacant) {
            Slot::Idle(instance) => {
                *slot = Slot::Running {
                    name: instance.name().to_string(),
                };
                Ok(instance)
            }
            Slot::Running { name } => {
                *slot = Slot::Running { name };
                Err(FaultKind::InstanceBusy.into())
            }
            Slot::Vacant => Err(FaultKind::InvalidHandle.into()),
        }
    }

    fn check_in(&mut self, handle: VmHandle, instance: Box<Instance>) {
        if let Some(slot) = self.slots.get_mut(handle.index()) {
            *slot = Slot::Idle(instance);
        }
    }
}

impl Drop for VmRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
