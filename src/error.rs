use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// The code cache has no room left for the block being generated. The
    /// caller is expected to reset the back end (flushing all generated code
    /// and the hash table) and regenerate from scratch.
    #[error("code cache exhausted")]
    CacheFull,

    /// The assembler rejected an emitted sequence, e.g. a branch target out
    /// of range or an impossible relocation. Not recoverable.
    #[error("assembler error: {0}")]
    Asm(String),

    /// Reserving the executable arena from the operating system failed.
    #[error("failed to map executable cache: {0}")]
    CacheMap(&'static str),
}
