#![no_std]

// This file exists to enable the library target; the program itself
// lives in main.rs.
