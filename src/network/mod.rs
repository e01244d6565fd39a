//! Address allocation and isolated network provisioning.

pub mod allocator;
pub mod provisioner;

pub use self::allocator::AddressPool;
pub use self::provisioner::{NetworkProvisioner, ProvisionedNetwork};
