pub mod batcher;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod errors;
pub mod offset;
pub mod stream;
pub mod supervisor;
pub mod telemetry;

pub use broker::{BrokerClient, BrokerSubscription, OffsetCommitter, RawRecord, SubscriptionSpec};
pub use config::{BrokerOptions, ConsumeConfig, PipelineConfig, PipelineDefaults};
pub use coordinator::{PipelineHandle, SubscribeOutcome, subscribe};
pub use decode::{TypeFilter, TypedPayload};
pub use errors::{BrokerError, ConfigError, PipelineError, Result};
pub use offset::{Envelope, Offset, OffsetBatch, UntypedEnvelope};
pub use stream::{ConsumptionStream, ProcessingStage};
pub use supervisor::PipelineState;
pub use telemetry::{MetricsSnapshot, PipelineMetrics};
