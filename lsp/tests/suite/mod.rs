mod session;
mod window;
