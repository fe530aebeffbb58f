//! Custom Resource Definitions consumed by the webhook

mod dynakube;

pub use dynakube::{
    DynaKube, DynaKubeSpec, DynaKubeStatus, MetadataEnrichmentSpec, OneAgentMode, OneAgentSpec,
    FEATURE_AUTOMATIC_INJECTION, FEATURE_DISABLE_REINVOCATION_POLICY,
    FEATURE_INJECTION_FAILURE_POLICY, FEATURE_READ_ONLY_CSI_VOLUME,
};
