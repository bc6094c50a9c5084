mod capture;
mod envelope;
mod identity;
mod marker;
mod media;
mod publish;
mod relay;
mod result;
mod session;

pub use capture::*;
pub use envelope::*;
pub use identity::*;
pub use marker::*;
pub use media::*;
pub use publish::*;
pub use relay::*;
pub use result::*;
pub use session::*;
