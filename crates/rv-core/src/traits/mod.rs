//! Collaborator trait definitions

mod credentials;
mod directory;

pub use credentials::CredentialProvider;
pub use directory::DirectoryService;
