pub mod postback;
