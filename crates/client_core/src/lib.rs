pub mod error;
pub mod movie_search;
pub mod reconciler;
pub mod session;

pub use error::ReconcileError;
pub use movie_search::{HttpMovieSearch, MissingMovieSearch, MovieSearch, DEFAULT_MOVIE_API_URL};
pub use reconciler::{DragOutcome, OrderedCollectionReconciler, RemoteOutcome, StagedDrop};
pub use session::{DropOutcome, LogSession, SessionEvent, SessionOptions};
