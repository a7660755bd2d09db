mod automaton;
mod codec;
mod region;
