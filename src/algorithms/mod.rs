//! Collection of the concrete detection and description algorithms, plus the
//! approximate nearest neighbour index, behind the pluggable feature strategies

pub mod akaze;
pub mod brief;
pub mod brisk;
pub mod corners;
pub mod fast;
pub mod freak;
pub mod kdtree;
pub mod orb;
pub mod scale_space;
pub mod sift;
