use std::sync::Arc;

use crate::connection::{FrameCodec, SerialConnector, SerialPortDiscovery, SerialSettings};
use crate::decoders::DefaultDecoder;
use crate::events::EventBus;
use crate::supervisor::SupervisorConfig;
use crate::CrownstoneUart;

impl CrownstoneUart {
    /// Create a client for a dongle on one of the system's serial ports
    ///
    /// `codec` provides the byte level framing of the link.
    pub fn serial(codec: Arc<dyn FrameCodec>, config: SupervisorConfig) -> CrownstoneUart {
        Self::serial_with_settings(codec, config, SerialSettings::default())
    }

    /// Like [`serial`](Self::serial), with custom serial transport settings
    pub fn serial_with_settings(
        codec: Arc<dyn FrameCodec>,
        config: SupervisorConfig,
        settings: SerialSettings,
    ) -> CrownstoneUart {
        let bus = EventBus::new();
        let connector = SerialConnector::with_settings(bus.clone(), codec, settings);

        CrownstoneUart::new(
            bus,
            config,
            Arc::new(SerialPortDiscovery),
            Arc::new(connector),
            Arc::new(DefaultDecoder),
        )
    }
}
