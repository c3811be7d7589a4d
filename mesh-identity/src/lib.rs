//! Peer descriptors, canonical encoding, anti-rollback sequencing, and the
//! certificate pin store for the mesh transport core.

pub mod canonical;
pub mod descriptor;
pub mod pins;

pub use canonical::{descriptor_signable_bytes, envelope_signable_bytes};
pub use descriptor::{
    is_valid_i2p_host, is_valid_onion_host, sign, verify_descriptor_with_key, DescriptorError,
    PeerDescriptor, Scope, SequenceTracker, TransportEndpoint, TransportType,
};
pub use pins::{compute_pin, CertificatePinStore, PeerCertificateInfo, PinError};
