//! Appliance power monitoring behind a FRITZ!Box style home router.
//!
//! [`FritzBox`] reads smart-plug values through an authenticated
//! [`SessionManager`]; [`SamplingLoop`] feeds those readings into per
//! appliance [`HysteresisTrigger`]s, which emit [`ApplianceEvent`]s when an
//! appliance durably starts or stops.

pub mod appliance;
pub mod device;
pub mod digest;
pub mod error;
pub mod events;
pub mod sampler;
pub mod session;
pub mod trigger;

pub use appliance::{Appliance, ApplianceMonitor, TriggerConfig};
pub use device::{FritzBox, Metric};
pub use digest::{solve, Challenge, ChallengeError};
pub use error::DeviceError;
pub use events::{
    dispatch, dispatch_with_timeout, event_stream, ApplianceEvent, EventSender, EventSink,
    EventStream, ReadingSink, Transition, SINK_TIMEOUT,
};
pub use sampler::{LoopStats, SamplingLoop, StatsSnapshot, TickReport};
pub use session::{DeviceSettings, SessionInfo, SessionManager, INVALID_SID};
pub use trigger::HysteresisTrigger;
