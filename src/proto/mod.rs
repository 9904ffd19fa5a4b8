//! Vendored protobuf/gRPC definitions for the gNMI service.
//!
//! The contents of `gnmi.rs` are generated from the upstream `gnmi.proto`
//! with `prost-build`/`tonic-build` (client only, btree maps) and checked in
//! so that builds do not require `protoc`.

#[allow(clippy::enum_variant_names)]
#[allow(clippy::trivially_copy_pass_by_ref)]
#[allow(unused_qualifications)]
pub mod gnmi;

pub use gnmi::g_nmi_client::GNmiClient;
