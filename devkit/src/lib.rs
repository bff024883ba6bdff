/*!
# powerwatch devkit - test doubles

- [`FakeFritzBox`]: a local router answering the login and switch web services
- [`MockMqttClient`]: records MQTT publishes without a broker
- [`Recorder`] and [`wait_until`] for asserting on asynchronous effects
*/

pub mod fake_router;
pub mod mqtt_stub;
pub mod test_utils;

pub use fake_router::{Counters, FakeConfig, FakeFritzBox};
pub use mqtt_stub::MockMqttClient;
pub use test_utils::{init_logging, wait_until, Recorder};
