//! Late-bound code handles.
//!
//! A handle is a named, mutable code pointer slot. References to a handle may
//! be emitted before the handle is bound; emission resolves to a direct call
//! when the target is already known and to an indirect load of the slot
//! otherwise. Slots are boxed so their addresses survive arena reallocation
//! and moves of the owning back end.

use crate::hash::CodePtr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleId(u32);

impl HandleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct HandleSlot {
    codeptr: CodePtr,
    name: String,
}

pub struct Handles {
    slots: Vec<Box<HandleSlot>>,
}

impl Handles {
    pub fn new() -> Handles {
        Handles { slots: Vec::new() }
    }

    pub fn create(&mut self, name: &str) -> HandleId {
        self.slots.push(Box::new(HandleSlot {
            codeptr: std::ptr::null(),
            name: name.to_owned(),
        }));
        HandleId((self.slots.len() - 1) as u32)
    }

    pub fn name(&self, handle: HandleId) -> &str {
        &self.slots[handle.index()].name
    }

    pub fn codeptr(&self, handle: HandleId) -> CodePtr {
        self.slots[handle.index()].codeptr
    }

    /// Address of the pointer slot itself, for indirect calls to handles
    /// that are not bound yet at emission time.
    pub fn codeptr_addr(&self, handle: HandleId) -> *const CodePtr {
        &self.slots[handle.index()].codeptr
    }

    pub fn set_codeptr(&mut self, handle: HandleId, code: CodePtr) {
        self.slots[handle.index()].codeptr = code;
    }

    /// Forget all bindings; used when the code cache is flushed.
    pub fn unbind_all(&mut self) {
        for slot in &mut self.slots {
            slot.codeptr = std::ptr::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_bind_lookup() {
        let mut handles = Handles::new();
        let h = handles.create("entry");
        assert_eq!(handles.name(h), "entry");
        assert!(handles.codeptr(h).is_null());

        let slot = handles.codeptr_addr(h);
        handles.set_codeptr(h, 0x1234 as CodePtr);
        assert_eq!(handles.codeptr(h), 0x1234 as CodePtr);
        // the slot address observes the binding without re-resolution
        assert_eq!(unsafe { *slot }, 0x1234 as CodePtr);

        handles.unbind_all();
        assert!(handles.codeptr(h).is_null());
    }
}
