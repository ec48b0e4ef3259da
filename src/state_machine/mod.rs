pub mod link_sm;
