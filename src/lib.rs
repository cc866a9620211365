pub mod bj;
