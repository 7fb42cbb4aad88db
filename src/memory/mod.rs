pub mod data_buf;
pub mod registration_pool;
pub mod remote_buf;

pub use data_buf::{DataBuf, DmaDirection, ScatterEntry};
pub use registration_pool::{
    PoolStats, RegistrationDescriptor, RegistrationLease, RegistrationPool,
};
pub use remote_buf::RemoteRegion;
