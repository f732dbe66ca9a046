pub mod courier;
pub mod offer;
pub mod order;
