pub mod enums;
pub mod appointment;
pub mod automation;
pub mod confirmation;
pub mod conversation;
pub mod legal;
pub mod patient;

pub use appointment::*;
pub use automation::*;
pub use confirmation::*;
pub use conversation::*;
pub use legal::*;
pub use patient::*;
