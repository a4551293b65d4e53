//! Protobuf messages of the `pipeflow.v1` cluster protocol.
//!
//! Every frame on the wire is one [`Envelope`]. Field tags are part of the
//! protocol: never reuse or renumber them.

/// Addressed frame between two ranks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub source: u32,
    #[prost(uint32, tag = "2")]
    pub target: u32,
    #[prost(oneof = "envelope::Payload", tags = "3, 4, 5, 6, 7, 8")]
    pub payload: ::core::option::Option<envelope::Payload>,
}

/// Nested message and enum types in `Envelope`.
pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// Worker -> Manager, first frame after (re)start.
        #[prost(message, tag = "3")]
        Hello(super::WorkerHello),
        /// Worker -> Manager, periodic liveness.
        #[prost(message, tag = "4")]
        Heartbeat(super::Heartbeat),
        /// Manager -> Worker.
        #[prost(message, tag = "5")]
        Assign(super::UnitAssignment),
        /// Manager -> Worker.
        #[prost(message, tag = "6")]
        Cancel(super::CancelRun),
        /// Manager -> Worker.
        #[prost(message, tag = "7")]
        Shutdown(super::Shutdown),
        /// Worker -> Manager, terminal outcome of an assignment.
        #[prost(message, tag = "8")]
        Report(super::UnitReport),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerHello {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(string, tag = "2")]
    pub hostname: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(bool, tag = "2")]
    pub busy: bool,
    /// Unit currently executing, empty when idle.
    #[prost(string, tag = "3")]
    pub unit_id: ::prost::alloc::string::String,
    #[prost(int64, tag = "4")]
    pub timestamp_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepSpec {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub inputs: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "3")]
    pub outputs: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(btree_map = "string, string", tag = "4")]
    pub params: ::prost::alloc::collections::BTreeMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnitAssignment {
    #[prost(string, tag = "1")]
    pub run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub unit_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub step: ::core::option::Option<StepSpec>,
    #[prost(uint32, tag = "4")]
    pub attempt: u32,
    #[prost(int64, tag = "5")]
    pub issued_at_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelRun {
    #[prost(string, tag = "1")]
    pub run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub reason: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Shutdown {
    /// How long a busy worker may keep executing before it must stop.
    #[prost(uint64, tag = "1")]
    pub grace_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatasetHandle {
    #[prost(string, tag = "1")]
    pub dataset: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub location: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Diagnostic {
    #[prost(string, tag = "1")]
    pub kind: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnitReport {
    #[prost(string, tag = "1")]
    pub run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub unit_id: ::prost::alloc::string::String,
    #[prost(enumeration = "UnitStatus", tag = "3")]
    pub status: i32,
    #[prost(message, repeated, tag = "4")]
    pub outputs: ::prost::alloc::vec::Vec<DatasetHandle>,
    #[prost(message, optional, tag = "5")]
    pub diagnostic: ::core::option::Option<Diagnostic>,
    #[prost(int64, tag = "6")]
    pub finished_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UnitStatus {
    Unspecified = 0,
    Complete = 1,
    Failed = 2,
    Cancelled = 3,
}
