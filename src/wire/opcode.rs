//! Binary protocol opcodes used by the KV operations this crate implements (spec §4.A, §6).

#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    GetAndLock = 0x94,
    UnlockKey = 0x95,
    ObserveSeqno = 0x91,
    SubdocLookupIn = 0xd0,
    SubdocMutateIn = 0xd1,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    SelectBucket = 0x89,
    GetClusterConfig = 0xb5,
    GetCollectionsManifest = 0xba,
    GetErrorMap = 0xfe,
}
