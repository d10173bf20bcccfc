use crate::Result;

pub trait Data: Send + Sync {
    /// Forces the store's write-ahead state onto disk.
    fn flush(&self) -> Result<()>;
}
