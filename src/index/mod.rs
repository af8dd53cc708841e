pub mod btree;
pub mod comparator;
pub mod posting;
