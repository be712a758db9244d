pub mod signature;

pub use signature::{
    generate_timestamped_signature, parse_signature_header, verify_timestamped_signature,
    SignatureError, SignatureHeader,
};
