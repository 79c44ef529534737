//! Store automations
//!
//! Everything that knows what a particular retailer's pages look like lives
//! here. The monitor loop only sees the `StoreAutomation` trait.

pub mod registry;
pub mod selector;
pub mod traits;

pub use registry::{StoreFactory, StoreRegistry};
pub use selector::{CheckoutEntry, SelectorOverrides, SelectorStore, StoreSelectors};
pub use traits::{LoginStatus, PageState, StoreAutomation};
