pub mod domain;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockCaptureDevice;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockEventPublisher;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockMediaUploader;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockProcessedMarkerStore;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockSessionRelay;
