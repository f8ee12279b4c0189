mod device;

pub use device::OwnerDevice;
