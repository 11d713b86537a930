pub mod address;
pub mod constants;
pub mod conversions;
pub mod logger;
pub mod options;
pub mod os;
#[cfg(any(test, feature = "mock_test"))]
pub mod test_util;

pub use self::address::Address;
