/// One thread recovered from a `NT_PRSTATUS` note.
#[derive(Clone, Debug)]
pub struct Thread {
    /// 1-based, in note order.
    pub number: usize,
    /// Base of the mapped range holding the stack.
    pub stack_base: u64,
    pub stack_pointer: u64,
    /// Derived upper bound of the stack; see the self-reference scan.
    pub stack_limit: u64,
    /// General-purpose registers in the architecture's dump order.
    pub registers: Vec<u64>,
}

/// All threads of the dumped process, with the architecture's register
/// naming.
#[derive(Debug)]
pub struct ThreadMap {
    register_names: &'static [&'static str],
    threads: Vec<Thread>,
}

impl ThreadMap {
    #[must_use]
    pub const fn new(register_names: &'static [&'static str]) -> Self {
        Self {
            register_names,
            threads: Vec::new(),
        }
    }

    pub fn add_thread(&mut self, thread: Thread) {
        self.threads.push(thread);
    }

    /// Register names in dump order; holes carry an empty name.
    #[must_use]
    pub const fn register_names(&self) -> &'static [&'static str] {
        self.register_names
    }

    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter()
    }
}
