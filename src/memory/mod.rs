pub mod memview;
