mod backchannel;
mod sign_in;

pub use backchannel::{profile, redeem, refresh, validate};
pub use sign_in::{callback, ping, sign_in, sign_out, start};
