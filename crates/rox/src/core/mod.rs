pub mod flags;
pub mod impression;
pub mod overrides;
pub mod properties;
pub mod repositories;
