pub mod bitfield;
