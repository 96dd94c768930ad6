use colored::*;

mod object;
mod ptr;
mod trace;

pub use object::{
    hash_string, BoundMethod, Class, Closure, Function, Instance, LoxString, NativeFn,
    NativeFunction, Object, Upvalue,
};
pub use ptr::Gc;
use trace::Traced;

use crate::compiler::compiler::FunctionState;
use crate::debug::{LOG_GC, STRESS_GC};
use crate::table::Table;
use crate::vm::call_frame::CallFrame;
use crate::vm::value::Value;

const DEFAULT_NEXT_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Mark and sweep garbage collector, and the owner of everything the
/// collector needs to see: the heap itself plus all the root sets (the
/// value stack, globals, call frames, open upvalues and the functions
/// currently being compiled). The compiler and VM borrow this one context
/// instead of going through globals.
///
/// Uses the tri-color abstraction. Objects start out white; the roots are
/// marked gray, then the gray worklist is drained, blackening each object
/// by marking everything it references. Whatever is still white afterwards
/// is swept.
pub struct GC {
    /// The VM's value stack.
    pub stack: Vec<Value>,

    /// Global variables, keyed by interned name.
    pub globals: Table,

    /// Call frames of the running VM.
    pub call_frames: Vec<CallFrame>,

    /// Upvalues still pointing into the stack, sorted ascending by slot.
    pub open_upvalues: Vec<Gc<Object>>,

    /// Functions currently being compiled; their constants are roots even
    /// though no closure references them yet.
    pub functions: Vec<FunctionState>,

    /// The interned name of class initializers, looked up on every class
    /// call.
    pub init_string: Option<Gc<Object>>,

    /// Intern table: every live string, keyed by itself. Entries whose key
    /// is about to be swept are tombstoned first.
    strings: Table,

    /// All objects tracked by the GC. Boxing keeps the addresses stable
    /// while the list itself grows and shrinks.
    objects: Vec<Box<Traced<Object>>>,

    /// Objects reached but not yet traced. Grows through the system
    /// allocator, never through `on_track`, so collection cannot recurse.
    gray_list: Vec<Gc<Object>>,

    /// The total amount of bytes allocated so far.
    bytes_allocated: usize,

    /// When `bytes_allocated` reaches this amount the GC starts collecting.
    next_gc: usize,
}

impl GC {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            globals: Table::new(),
            call_frames: Vec::new(),
            open_upvalues: Vec::new(),
            functions: Vec::new(),
            init_string: None,
            strings: Table::new(),
            objects: Vec::new(),
            gray_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
        }
    }

    /// Moves `object` onto the managed heap and returns a reference to it.
    /// May collect before the allocation happens, so everything the caller
    /// still needs must be rooted at this point.
    pub fn track(&mut self, object: Object) -> Gc<Object> {
        self.on_track(object.size());
        self.objects.push(Box::new(Traced::new(object)));
        let object = self.objects.last_mut().unwrap();
        Gc::new(object)
    }

    /// Returns the single string object for `data`, allocating and
    /// registering it in the intern table only if these bytes are new.
    pub fn intern(&mut self, data: String) -> Gc<Object> {
        let hash = hash_string(&data);
        if let Some(existing) = self.strings.find_string(&data, hash) {
            return existing;
        }

        let object = self.track(Object::String(LoxString { data, hash }));
        self.strings.set(object, Value::Nil);
        object
    }

    #[cfg(test)]
    pub(crate) fn object_count(&self) -> usize {
        self.objects.len()
    }

    #[cfg(test)]
    pub(crate) fn collect_now(&mut self) {
        self.collect();
    }

    fn on_track(&mut self, allocated: usize) {
        if STRESS_GC {
            self.collect();
        }
        self.bytes_allocated += allocated;
        if self.bytes_allocated > self.next_gc {
            self.collect();
        }
    }

    /// Traces through all objects tracked by the garbage collector and
    /// determines which ones can be reached. The objects that cannot be
    /// reached are freed.
    fn collect(&mut self) {
        let before = self.bytes_allocated;
        if LOG_GC {
            println!("{}", "[GC]\t\tBEGIN".cyan());
        }

        self.mark_roots();
        self.trace_references();
        // The intern table references strings without rooting them. Scrub
        // the entries that are about to be swept.
        self.strings.remove_unmarked_keys();
        self.sweep();

        // Adjust when the GC should run next.
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;

        if LOG_GC {
            println!(
                "{}\t\tCollected {} bytes (from {} to {}) next at {}",
                "[GC]".cyan(),
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
            println!("{}", "[GC]\t\tEND".cyan());
        }
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i].clone();
            self.mark_value(value);
        }

        for i in 0..self.call_frames.len() {
            let closure = self.call_frames[i].closure;
            self.mark_object(closure);
        }

        let open_upvalues = self.open_upvalues.clone();
        for upvalue in open_upvalues {
            self.mark_object(upvalue);
        }

        self.mark_table_entries(&self.globals as *const Table);

        if let Some(init_string) = self.init_string {
            self.mark_object(init_string);
        }

        // The functions being compiled are not reachable through any
        // closure yet; mark their names and constants directly.
        for i in 0..self.functions.len() {
            if let Some(name) = self.functions[i].function.name {
                self.mark_object(name);
            }
            for j in 0..self.functions[i].function.chunk.constants.len() {
                let constant = self.functions[i].function.chunk.constants[j].clone();
                self.mark_value(constant);
            }
        }
    }

    /// Drains the gray list, blackening each object by marking everything
    /// it references.
    fn trace_references(&mut self) {
        while let Some(object) = self.gray_list.pop() {
            self.blacken(object);
        }
    }

    /// Marks a value as reachable if it references an object, otherwise
    /// does nothing.
    fn mark_value(&mut self, value: Value) {
        if let Value::Object(object) = value {
            self.mark_object(object);
        }
    }

    /// Marks an object as reachable and queues it once for tracing.
    fn mark_object(&mut self, object: Gc<Object>) {
        // With the tri-color abstraction `marked` covers both gray and
        // black; an object already on (or through) the gray list is never
        // queued again.
        if !object.marked() {
            if LOG_GC {
                println!("{}\t\tMarking: {:?}", "[GC]".cyan(), object);
            }
            object.set_mark(true);
            self.gray_list.push(object);
        }
    }

    /// Marks every key and value of a table. Takes a raw pointer because
    /// the table is reached through `self` while `self` is also needed
    /// mutably for the marking itself; the table is not modified.
    fn mark_table_entries(&mut self, table: *const Table) {
        let entries: Vec<(Gc<Object>, Value)> = unsafe { &*table }
            .iter()
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        for (key, value) in entries {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Finishes the processing of a gray object, marking every object it
    /// can reach.
    fn blacken(&mut self, object: Gc<Object>) {
        if LOG_GC {
            println!("{}\t\tBlacken: {:?}", "[GC]".cyan(), object);
        }
        match object.as_ref() {
            Object::String(_) => {}
            Object::Native(native) => {
                let name = native.name;
                self.mark_object(name);
            }
            Object::Function(function) => {
                let name = function.name;
                let constants = function.chunk.constants.clone();
                if let Some(name) = name {
                    self.mark_object(name);
                }
                for constant in constants {
                    self.mark_value(constant);
                }
            }
            Object::Closure(closure) => {
                let function = closure.function;
                let upvalues = closure.upvalues.clone();
                self.mark_object(function);
                for upvalue in upvalues {
                    self.mark_object(upvalue);
                }
            }
            Object::Upvalue(upvalue) => {
                if let Upvalue::Closed(value) = upvalue {
                    let value = value.clone();
                    self.mark_value(value);
                }
            }
            Object::Class(class) => {
                let name = class.name;
                let methods = &class.methods as *const Table;
                self.mark_object(name);
                self.mark_table_entries(methods);
            }
            Object::Instance(instance) => {
                let class = instance.class;
                let fields = &instance.fields as *const Table;
                self.mark_object(class);
                self.mark_table_entries(fields);
            }
            Object::BoundMethod(bound) => {
                let receiver = bound.receiver.clone();
                let method = bound.method;
                self.mark_value(receiver);
                self.mark_object(method);
            }
        }
    }

    /// Frees all objects left white and clears the mark on the survivors.
    fn sweep(&mut self) {
        let mut freed = 0;
        self.objects.retain(|object| {
            if object.marked() {
                object.set_mark(false);
                true
            } else {
                if LOG_GC {
                    println!("{}\t\t[Sweep] {:?}", "[GC]".cyan(), object.data);
                }
                freed += object.data.size();
                false
            }
        });
        self.bytes_allocated -= freed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut gc = GC::new();
        let a = gc.intern("hello".to_owned());
        let b = gc.intern("hello".to_owned());
        let c = gc.intern("world".to_owned());
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(gc.object_count(), 2);
    }

    #[test]
    fn collect_frees_unrooted_objects() {
        let mut gc = GC::new();
        let kept = gc.intern("kept".to_owned());
        gc.stack.push(Value::Object(kept));
        gc.intern("garbage".to_owned());
        assert_eq!(gc.object_count(), 2);

        gc.collect_now();
        assert_eq!(gc.object_count(), 1);

        // The freed string is gone from the intern table; the survivor is
        // still the canonical object for its bytes.
        let again = gc.intern("kept".to_owned());
        assert!(again.ptr_eq(&kept));
        assert_eq!(gc.object_count(), 1);
        let resurrected = gc.intern("garbage".to_owned());
        assert!(!resurrected.ptr_eq(&kept));
    }

    #[test]
    fn collect_traces_through_tables() {
        let mut gc = GC::new();
        let name = gc.intern("Point".to_owned());
        let class = gc.track(Object::Class(Class::new(name)));
        let mut instance = Instance::new(class);

        let field = gc.intern("x".to_owned());
        instance.fields.set(field, Value::Number(3.0));
        let instance = gc.track(Object::Instance(instance));
        gc.stack.push(Value::Object(instance));

        gc.collect_now();
        // Instance, class, class name and field name all survive.
        assert_eq!(gc.object_count(), 4);
    }

    #[test]
    fn marks_are_cleared_after_collect() {
        let mut gc = GC::new();
        let s = gc.intern("still here".to_owned());
        gc.stack.push(Value::Object(s));
        gc.collect_now();
        assert_eq!(gc.object_count(), 1);

        // A stale mark would keep the object alive once it is unrooted.
        gc.stack.clear();
        gc.collect_now();
        assert_eq!(gc.object_count(), 0);
    }

    #[test]
    fn closed_upvalue_keeps_value_alive() {
        let mut gc = GC::new();
        let captured = gc.intern("captured".to_owned());
        let upvalue = gc.track(Object::Upvalue(Upvalue::Closed(Value::Object(captured))));
        gc.open_upvalues.push(upvalue);

        gc.collect_now();
        assert_eq!(gc.object_count(), 2);
    }
}
